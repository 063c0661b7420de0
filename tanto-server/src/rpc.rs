//! # Binary RPC Surface
//!
//! Length-prefixed binary protocol over TCP, one request frame per turn:
//!
//! ```text
//! request  := u32 BE length | u8 opcode | u32 BE deadline_ms | fields
//! response := u32 BE length | u8 status | body
//! field    := u32 BE length | bytes     (byte strings)
//!           | i64 BE                    (ttl)
//! ```
//!
//! Field order per opcode:
//!
//! | opcode        | request fields                  | ok body                        |
//! |---------------|---------------------------------|--------------------------------|
//! | 1 `Create`    | name                            | name, created, exists, api_key |
//! | 2 `Exists`    | db                              | exists                         |
//! | 3 `Set`       | db, api_key, key, value, ttl    | ok                             |
//! | 4 `SetNx`     | db, api_key, key, value, ttl    | ok                             |
//! | 5 `Incr`      | db, api_key, key, amount        | ok                             |
//! | 6 `Get`       | db, api_key, key                | found, value                   |
//! | 7 `Del`       | db, api_key, key                | ok                             |
//! | 8 `DropDb`    | db, api_key                     | ok                             |
//! | 9 `RotateKey` | db, api_key                     | api_key                        |
//!
//! A non-zero status carries a length-prefixed message instead of the body.
//!
//! Every call must carry a client deadline: `deadline_ms == 0` and deadlines
//! beyond the configured cap are rejected with `InvalidArgument`. Messages
//! over 1 MiB are rejected in both directions. Admission is a non-blocking
//! semaphore; a saturated surface answers `Overload`.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use tanto_core::admission::AdmissionGate;
use tanto_core::error::{Error, Result};
use tanto_core::utils::valid_db_name;
use tanto_storage::Engine;

/// Maximum message size in both directions.
pub const MAX_MESSAGE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Create = 1,
    Exists = 2,
    Set = 3,
    SetNx = 4,
    Incr = 5,
    Get = 6,
    Del = 7,
    DropDb = 8,
    RotateKey = 9,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => OpCode::Create,
            2 => OpCode::Exists,
            3 => OpCode::Set,
            4 => OpCode::SetNx,
            5 => OpCode::Incr,
            6 => OpCode::Get,
            7 => OpCode::Del,
            8 => OpCode::DropDb,
            9 => OpCode::RotateKey,
            other => {
                return Err(Error::InvalidArgument {
                    message: format!("unknown opcode {other}"),
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    InvalidArgument = 1,
    NotFound = 2,
    Conflict = 3,
    Unauthorized = 4,
    Overload = 5,
    Full = 6,
    Internal = 7,
}

fn status_for(err: &Error) -> Status {
    match err {
        Error::InvalidName { .. } | Error::InvalidArgument { .. } => Status::InvalidArgument,
        Error::DatabaseNotFound { .. } => Status::NotFound,
        Error::Conflict { .. } => Status::Conflict,
        Error::Unauthorized { .. } => Status::Unauthorized,
        Error::Overload => Status::Overload,
        Error::Full { .. } => Status::Full,
        Error::Io { .. } | Error::Internal { .. } => Status::Internal,
    }
}

/// Accept loop; one task per connection, requests handled sequentially per
/// connection.
pub async fn serve(listener: TcpListener, engine: Arc<Engine>) -> std::io::Result<()> {
    let gate = Arc::new(AdmissionGate::new(engine.config().rpc.request_limit));
    info!("RPC surface listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, engine, gate).await {
                debug!("rpc connection {peer} closed: {e}");
            }
        });
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    engine: Arc<Engine>,
    gate: Arc<AdmissionGate>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // client hung up between requests
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE {
            // framing is unrecoverable past this point: answer and drop
            let body = error_body(&Error::InvalidArgument {
                message: format!("message size {len} outside 1..={MAX_MESSAGE}"),
            });
            write_frame(&mut stream, &body).await?;
            return Ok(());
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        let mut response = process(&engine, &gate, &payload);
        if response.len() > MAX_MESSAGE {
            response = error_body(&Error::Internal {
                message: "response exceeds the 1 MiB message cap".to_string(),
            });
        }
        write_frame(&mut stream, &response).await?;
    }
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Decode, admit, dispatch; always yields a response body.
pub fn process(engine: &Engine, gate: &AdmissionGate, payload: &[u8]) -> Vec<u8> {
    match handle(engine, gate, payload) {
        Ok(body) => body,
        Err(e) => {
            if matches!(e, Error::Overload) {
                engine.metrics().record_overload();
            }
            error_body(&e)
        }
    }
}

fn handle(engine: &Engine, gate: &AdmissionGate, payload: &[u8]) -> Result<Vec<u8>> {
    let mut c = Cursor::new(payload);
    let op = OpCode::try_from(get_u8(&mut c)?)?;
    let deadline_ms = get_u32(&mut c)?;

    let _permit = gate.try_enter()?;

    if deadline_ms == 0 {
        return Err(Error::InvalidArgument {
            message: "client deadline required".to_string(),
        });
    }
    let max_ms = engine.config().rpc.max_duration_secs.saturating_mul(1000);
    if u64::from(deadline_ms) > max_ms {
        return Err(Error::InvalidArgument {
            message: format!("client deadline exceeds the {max_ms} ms cap"),
        });
    }

    match op {
        OpCode::Create => {
            let name = get_str(&mut c)?;
            check_db_name(&name)?;
            let outcome = engine.new_db(&name)?;
            let mut body = ok_body();
            put_bytes(&mut body, outcome.name.as_bytes());
            body.push(outcome.created as u8);
            body.push(outcome.existed as u8);
            put_bytes(&mut body, outcome.api_key.unwrap_or_default().as_bytes());
            Ok(body)
        }
        OpCode::Exists => {
            let db = get_str(&mut c)?;
            check_db_name(&db)?;
            let mut body = ok_body();
            body.push(engine.db_exists(&db) as u8);
            Ok(body)
        }
        OpCode::Set | OpCode::SetNx => {
            let (db, _) = authenticated(engine, &mut c)?;
            let key = get_bytes(&mut c)?;
            let value = get_bytes(&mut c)?;
            let ttl = get_i64(&mut c)?;
            let ok = if op == OpCode::Set {
                engine.set(&db, key, value, ttl)?
            } else {
                engine.set_nx(&db, key, value, ttl)?
            };
            Ok(bool_body(ok))
        }
        OpCode::Incr => {
            let (db, _) = authenticated(engine, &mut c)?;
            let key = get_bytes(&mut c)?;
            let amount = get_bytes(&mut c)?;
            Ok(bool_body(engine.incr(&db, key, amount)?))
        }
        OpCode::Get => {
            let (db, _) = authenticated(engine, &mut c)?;
            let key = get_bytes(&mut c)?;
            let value = engine.get(&db, &key)?;
            let mut body = ok_body();
            body.push(value.is_some() as u8);
            put_bytes(&mut body, value.as_deref().unwrap_or_default());
            Ok(body)
        }
        OpCode::Del => {
            let (db, _) = authenticated(engine, &mut c)?;
            let key = get_bytes(&mut c)?;
            Ok(bool_body(engine.del(&db, &key)?))
        }
        OpCode::DropDb => {
            let (db, _) = authenticated(engine, &mut c)?;
            engine.db_delete(&db)?;
            Ok(bool_body(true))
        }
        OpCode::RotateKey => {
            let (db, _) = authenticated(engine, &mut c)?;
            let api_key = engine.create_api_key(&db)?;
            let mut body = ok_body();
            put_bytes(&mut body, api_key.as_bytes());
            Ok(body)
        }
    }
}

/// Shared prefix of authenticated ops: db name plus credential check.
fn authenticated(engine: &Engine, c: &mut Cursor<&[u8]>) -> Result<(String, String)> {
    let db = get_str(c)?;
    check_db_name(&db)?;
    let api_key = get_str(c)?;
    if engine.config().auth.enabled && !engine.is_api_key_valid(&db, &api_key) {
        engine.metrics().record_unauthorized();
        return Err(Error::Unauthorized {
            reason: "invalid api key".to_string(),
        });
    }
    Ok((db, api_key))
}

fn check_db_name(db: &str) -> Result<()> {
    if !valid_db_name(db) {
        return Err(Error::InvalidArgument {
            message: "invalid db name".to_string(),
        });
    }
    Ok(())
}

// ---- body encoding ----

fn ok_body() -> Vec<u8> {
    vec![Status::Ok as u8]
}

fn bool_body(ok: bool) -> Vec<u8> {
    vec![Status::Ok as u8, ok as u8]
}

fn error_body(err: &Error) -> Vec<u8> {
    let mut body = vec![status_for(err) as u8];
    put_bytes(&mut body, err.to_string().as_bytes());
    body
}

fn put_bytes(buf: &mut Vec<u8>, raw: &[u8]) {
    buf.extend_from_slice(&(raw.len() as u32).to_be_bytes());
    buf.extend_from_slice(raw);
}

// ---- request decoding ----

fn truncated() -> Error {
    Error::InvalidArgument {
        message: "truncated request".to_string(),
    }
}

fn get_u8(c: &mut Cursor<&[u8]>) -> Result<u8> {
    ReadBytesExt::read_u8(c).map_err(|_| truncated())
}

fn get_u32(c: &mut Cursor<&[u8]>) -> Result<u32> {
    ReadBytesExt::read_u32::<BigEndian>(c).map_err(|_| truncated())
}

fn get_i64(c: &mut Cursor<&[u8]>) -> Result<i64> {
    ReadBytesExt::read_i64::<BigEndian>(c).map_err(|_| truncated())
}

fn get_bytes(c: &mut Cursor<&[u8]>) -> Result<Bytes> {
    let len = get_u32(c)? as usize;
    let pos = c.position() as usize;
    let data = *c.get_ref();
    if pos + len > data.len() {
        return Err(truncated());
    }
    c.set_position((pos + len) as u64);
    Ok(Bytes::copy_from_slice(&data[pos..pos + len]))
}

fn get_str(c: &mut Cursor<&[u8]>) -> Result<String> {
    let raw = get_bytes(c)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidArgument {
        message: "field is not valid UTF-8".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanto_core::config::Config;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        engine: Arc<Engine>,
        gate: AdmissionGate,
    }

    fn harness(auth: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.storage.db_folder = dir.path().to_path_buf();
        cfg.auth.enabled = auth;
        let engine = Arc::new(Engine::new(cfg).unwrap());
        Harness {
            _dir: dir,
            engine,
            gate: AdmissionGate::new(64),
        }
    }

    struct RequestBuilder(Vec<u8>);

    impl RequestBuilder {
        fn new(op: OpCode, deadline_ms: u32) -> Self {
            let mut buf = vec![op as u8];
            buf.extend_from_slice(&deadline_ms.to_be_bytes());
            Self(buf)
        }

        fn field(mut self, raw: &[u8]) -> Self {
            put_bytes(&mut self.0, raw);
            self
        }

        fn ttl(mut self, ttl: i64) -> Self {
            self.0.extend_from_slice(&ttl.to_be_bytes());
            self
        }

        fn build(self) -> Vec<u8> {
            self.0
        }
    }

    fn parse_bytes(body: &[u8], at: &mut usize) -> Vec<u8> {
        let len = u32::from_be_bytes(body[*at..*at + 4].try_into().unwrap()) as usize;
        *at += 4;
        let raw = body[*at..*at + len].to_vec();
        *at += len;
        raw
    }

    #[test]
    fn test_create_set_get_round_trip() {
        let h = harness(false);

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Create, 1000).field(b"rpcdb").build(),
        );
        assert_eq!(resp[0], Status::Ok as u8);
        let mut at = 1;
        assert_eq!(parse_bytes(&resp, &mut at), b"RPCDB");
        assert_eq!(resp[at], 1, "created");
        assert_eq!(resp[at + 1], 0, "did not exist");

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Set, 1000)
                .field(b"rpcdb")
                .field(b"")
                .field(b"k")
                .field(b"v")
                .ttl(0)
                .build(),
        );
        assert_eq!(resp, vec![Status::Ok as u8, 1]);

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Get, 1000)
                .field(b"rpcdb")
                .field(b"")
                .field(b"k")
                .build(),
        );
        assert_eq!(resp[0], Status::Ok as u8);
        assert_eq!(resp[1], 1, "found");
        let mut at = 2;
        assert_eq!(parse_bytes(&resp, &mut at), b"v");

        h.engine.close_all();
    }

    #[test]
    fn test_deadline_is_required_and_capped() {
        let h = harness(false);
        h.engine.new_db("deadlines").unwrap();

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Exists, 0).field(b"deadlines").build(),
        );
        assert_eq!(resp[0], Status::InvalidArgument as u8);

        // cap is max_duration_secs (10 by default) in milliseconds
        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Exists, 60_000)
                .field(b"deadlines")
                .build(),
        );
        assert_eq!(resp[0], Status::InvalidArgument as u8);

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Exists, 5_000)
                .field(b"deadlines")
                .build(),
        );
        assert_eq!(resp, vec![Status::Ok as u8, 1]);

        h.engine.close_all();
    }

    #[test]
    fn test_auth_enforced() {
        let h = harness(true);
        let token = h.engine.new_db("guarded").unwrap().api_key.unwrap();

        let get = |key: &[u8]| {
            RequestBuilder::new(OpCode::Get, 1000)
                .field(b"guarded")
                .field(key)
                .field(b"k")
                .build()
        };

        let resp = process(&h.engine, &h.gate, &get(b""));
        assert_eq!(resp[0], Status::Unauthorized as u8);

        let resp = process(&h.engine, &h.gate, &get(b"wrong-key"));
        assert_eq!(resp[0], Status::Unauthorized as u8);

        let resp = process(&h.engine, &h.gate, &get(token.as_bytes()));
        assert_eq!(resp[0], Status::Ok as u8);

        h.engine.close_all();
    }

    #[test]
    fn test_missing_db_and_bad_requests() {
        let h = harness(false);

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Get, 1000)
                .field(b"nosuchdb")
                .field(b"")
                .field(b"k")
                .build(),
        );
        assert_eq!(resp[0], Status::NotFound as u8);

        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Create, 1000).field(b"not a name").build(),
        );
        assert_eq!(resp[0], Status::InvalidArgument as u8);

        // unknown opcode
        let mut raw = vec![99u8];
        raw.extend_from_slice(&1000u32.to_be_bytes());
        let resp = process(&h.engine, &h.gate, &raw);
        assert_eq!(resp[0], Status::InvalidArgument as u8);

        // truncated field
        let resp = process(
            &h.engine,
            &h.gate,
            &RequestBuilder::new(OpCode::Exists, 1000).build(),
        );
        assert_eq!(resp[0], Status::InvalidArgument as u8);
    }

    #[test]
    fn test_saturated_gate_answers_overload() {
        let h = harness(false);
        h.engine.new_db("busy").unwrap();
        let gate = AdmissionGate::new(1);
        let _held = gate.try_enter().unwrap();

        let resp = process(
            &h.engine,
            &gate,
            &RequestBuilder::new(OpCode::Exists, 1000).field(b"busy").build(),
        );
        assert_eq!(resp[0], Status::Overload as u8);
        h.engine.close_all();
    }

    #[test]
    fn test_conflict_status_mapping() {
        assert_eq!(
            status_for(&Error::Conflict {
                message: String::new()
            }),
            Status::Conflict
        );
        assert_eq!(
            status_for(&Error::Full {
                name: String::new(),
                max: 0
            }),
            Status::Full
        );
        assert_eq!(status_for(&Error::Overload), Status::Overload);
    }
}
