use bytes::Bytes;

/// One live key inside a table bucket.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// Cached keyed hash of `key`.
    pub hash: u64,
    pub key: Bytes,
    pub value: Bytes,
    /// Absolute unix-second expiry; 0 means the entry never expires.
    pub expiry: i64,
}
