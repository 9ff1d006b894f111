//! Shared record: what a header stores in place of a shared payload.
//!
//! Layout: version (3), kind (1 = heap, 2 = committed), 8-byte heap id or
//! object address.

use super::{HeapId, Reader, Sharing};
use crate::{HeaderError, Result};

pub(crate) const RECORD_SIZE: usize = 10;

const VERSION: u8 = 3;
const KIND_HEAP: u8 = 1;
const KIND_COMMITTED: u8 = 2;

pub(crate) fn encode(sharing: Sharing, out: &mut Vec<u8>) -> Result<()> {
    let (kind, value) = match sharing {
        Sharing::Heap(id) => (KIND_HEAP, id.0),
        Sharing::Committed(addr) => (KIND_COMMITTED, addr),
        Sharing::Unshared => {
            return Err(HeaderError::Argument(
                "cannot encode a shared record for an unshared message".into(),
            ))
        }
    };
    out.push(VERSION);
    out.push(kind);
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn decode(buf: &[u8]) -> Result<Sharing> {
    let mut r = Reader::new(buf, "shared record");
    r.version(VERSION)?;
    let kind = r.u8()?;
    let value = r.u64()?;
    match kind {
        KIND_HEAP => Ok(Sharing::Heap(HeapId(value))),
        KIND_COMMITTED => Ok(Sharing::Committed(value)),
        other => Err(r.error(format!("unknown share kind {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let mut out = Vec::new();
        encode(Sharing::Heap(HeapId(0x0102)), &mut out).unwrap();
        assert_eq!(out.len(), RECORD_SIZE);
        assert_eq!(&out[..4], &[3, 1, 0x02, 0x01]);
        assert_eq!(decode(&out).unwrap(), Sharing::Heap(HeapId(0x0102)));
    }

    #[test]
    fn test_unshared_cannot_be_recorded() {
        let mut out = Vec::new();
        assert!(encode(Sharing::Unshared, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_bad_kind_rejected() {
        let buf = [3u8, 9, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(decode(&buf), Err(HeaderError::Decode { .. })));
    }
}
