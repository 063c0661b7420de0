//! Request and response bodies of the JSON surface.

use serde::{Deserialize, Serialize};

use tanto_core::error::{Error, Result};
use tanto_storage::DbInfo;

const KEY_MAX_LEN: usize = 30_000;

#[derive(Debug, Deserialize)]
pub struct CreateDbRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDbResponse {
    pub name: String,
    pub created: bool,
    pub exists: bool,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    /// Accepted for wire compatibility; authentication uses the
    /// `X-API-Key` header.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub ttl: i64,
    pub key: String,
    pub value: String,
}

impl SetRequest {
    pub fn validate(&self) -> Result<()> {
        validate_key(&self.key)?;
        if self.value.is_empty() {
            return Err(Error::InvalidArgument {
                message: "value must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    #[serde(default)]
    pub api_key: String,
    pub key: String,
}

impl KeyRequest {
    pub fn validate(&self) -> Result<()> {
        validate_key(&self.key)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > KEY_MAX_LEN {
        return Err(Error::InvalidArgument {
            message: format!("key length must be 1..={KEY_MAX_LEN}"),
        });
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    pub found: bool,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyResponse {
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Landing page body: the registered databases and the auth mode.
#[derive(Debug, Serialize, Deserialize)]
pub struct LandingResponse {
    pub databases: Vec<DbSummary>,
    pub auth_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DbSummary {
    pub name: String,
    pub entries: u64,
    pub buckets: usize,
}

impl From<DbInfo> for DbSummary {
    fn from(info: DbInfo) -> Self {
        Self {
            name: info.name,
            entries: info.entries,
            buckets: info.buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_request_validation() {
        let ok = SetRequest {
            api_key: String::new(),
            ttl: 0,
            key: "k".into(),
            value: "v".into(),
        };
        assert!(ok.validate().is_ok());

        let empty_key = SetRequest {
            key: String::new(),
            ..ok_clone(&ok)
        };
        assert!(empty_key.validate().is_err());

        let empty_value = SetRequest {
            value: String::new(),
            ..ok_clone(&ok)
        };
        assert!(empty_value.validate().is_err());

        let long_key = SetRequest {
            key: "x".repeat(KEY_MAX_LEN + 1),
            ..ok_clone(&ok)
        };
        assert!(long_key.validate().is_err());
    }

    fn ok_clone(r: &SetRequest) -> SetRequest {
        SetRequest {
            api_key: r.api_key.clone(),
            ttl: r.ttl,
            key: r.key.clone(),
            value: r.value.clone(),
        }
    }

    #[test]
    fn test_set_request_defaults() {
        let req: SetRequest = serde_json::from_str(r#"{"key":"k","value":"v"}"#).unwrap();
        assert_eq!(req.ttl, 0);
        assert!(req.api_key.is_empty());
    }
}
