//! Log frame codec.
//!
//! Frames are self-delimiting and concatenated end to end, no file header:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┬─────────┐
//! │ u32 BE len   │ action bytes │ u32 BE len   │ key bytes    │  ...    │
//! ├──────────────┼──────────────┼──────────────┼──────────────┼─────────┤
//! │ u32 BE len   │ value bytes  │ i64 BE ttl   │              │         │
//! └──────────────┴──────────────┴──────────────┴──────────────┴─────────┘
//! ```
//!
//! A frame cut short by a crash mid-write reads as end-of-log: the partial
//! tail is discarded and everything before it is kept.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

#[derive(Debug)]
pub(crate) struct Frame {
    pub action: Vec<u8>,
    pub key: Bytes,
    pub value: Bytes,
    pub ttl: i64,
}

pub(crate) fn write_frame<W: Write>(
    w: &mut W,
    action: &[u8],
    key: &[u8],
    value: &[u8],
    ttl: i64,
) -> io::Result<()> {
    w.write_u32::<BigEndian>(action.len() as u32)?;
    w.write_all(action)?;
    w.write_u32::<BigEndian>(key.len() as u32)?;
    w.write_all(key)?;
    w.write_u32::<BigEndian>(value.len() as u32)?;
    w.write_all(value)?;
    w.write_i64::<BigEndian>(ttl)?;
    Ok(())
}

/// Read the next frame. `Ok(None)` means clean end-of-log: either exact EOF
/// or a truncated trailing frame. Any other IO failure is a real error.
pub(crate) fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Frame>> {
    let Some(action_len) = eof_to_none(r.read_u32::<BigEndian>())? else {
        return Ok(None);
    };
    let Some(action) = read_bytes(r, action_len as usize)? else {
        return Ok(None);
    };

    let Some(key_len) = eof_to_none(r.read_u32::<BigEndian>())? else {
        return Ok(None);
    };
    let Some(key) = read_bytes(r, key_len as usize)? else {
        return Ok(None);
    };

    let Some(value_len) = eof_to_none(r.read_u32::<BigEndian>())? else {
        return Ok(None);
    };
    let Some(value) = read_bytes(r, value_len as usize)? else {
        return Ok(None);
    };

    let Some(ttl) = eof_to_none(r.read_i64::<BigEndian>())? else {
        return Ok(None);
    };

    Ok(Some(Frame {
        action,
        key: Bytes::from(key),
        value: Bytes::from(value),
        ttl,
    }))
}

fn read_bytes<R: Read>(r: &mut R, len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; len];
    match eof_to_none(r.read_exact(&mut buf))? {
        Some(()) => Ok(Some(buf)),
        None => Ok(None),
    }
}

fn eof_to_none<T>(res: io::Result<T>) -> io::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"set", b"key1", b"value1", 30).unwrap();
        write_frame(&mut buf, b"del", b"key2", b"", 0).unwrap();

        let mut r = buf.as_slice();
        let f1 = read_frame(&mut r).unwrap().unwrap();
        assert_eq!(f1.action, b"set");
        assert_eq!(&f1.key[..], b"key1");
        assert_eq!(&f1.value[..], b"value1");
        assert_eq!(f1.ttl, 30);

        let f2 = read_frame(&mut r).unwrap().unwrap();
        assert_eq!(f2.action, b"del");
        assert_eq!(&f2.key[..], b"key2");
        assert!(f2.value.is_empty());

        assert!(read_frame(&mut r).unwrap().is_none());
    }

    #[test]
    fn test_negative_ttl_survives() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"set", b"k", b"v", -1).unwrap();
        let f = read_frame(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(f.ttl, -1);
    }

    #[test]
    fn test_truncated_tail_is_clean_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"set", b"whole", b"frame", 0).unwrap();
        let whole = buf.len();
        write_frame(&mut buf, b"set", b"partial", b"frame", 0).unwrap();

        // every possible cut inside the second frame keeps the first
        for cut in whole..buf.len() - 1 {
            let mut r = &buf[..cut];
            let first = read_frame(&mut r).unwrap();
            assert!(first.is_some(), "first frame lost at cut {cut}");
            assert!(
                read_frame(&mut r).unwrap().is_none(),
                "cut {cut} did not read as end-of-log"
            );
        }
    }

    #[test]
    fn test_encoded_size() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"set", b"key", b"value", 7).unwrap();
        // three u32 lengths, the three byte fields, one i64 ttl
        assert_eq!(buf.len(), 4 + 3 + 4 + 3 + 4 + 5 + 8);
    }
}
