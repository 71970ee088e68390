//! Minimal multihash codec.
//!
//! Only the two hash functions the peer identity model relies on are
//! registered: `identity` (the digest is the input itself) and `sha2-256`.
//! Wire format: `varint(code) | varint(len) | digest`.

use crate::{varint, CoreError, CoreResult};

/// Identity "hash": the digest embeds the input bytes unchanged.
pub const IDENTITY: u64 = 0x00;

/// SHA2-256.
pub const SHA2_256: u64 = 0x12;

/// Encode a digest under the given multihash code.
pub fn encode(code: u64, digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(digest.len() + 4);
    varint::encode(code, &mut out);
    varint::encode(digest.len() as u64, &mut out);
    out.extend_from_slice(digest);
    out
}

/// Decode a multihash, returning the code and the digest.
///
/// The whole input must be consumed and the code must be registered.
pub fn decode(bytes: &[u8]) -> CoreResult<(u64, &[u8])> {
    let (code, used) = varint::decode(bytes)?;
    let rest = &bytes[used..];
    let (len, used) = varint::decode(rest)?;
    let digest = &rest[used..];
    if digest.len() as u64 != len {
        return Err(CoreError::BadMultihash(format!(
            "digest length mismatch: header says {}, got {}",
            len,
            digest.len()
        )));
    }
    match code {
        IDENTITY | SHA2_256 => Ok((code, digest)),
        other => Err(CoreError::BadMultihash(format!(
            "unknown hash code {other:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let payload = b"some serialized public key";
        let mh = encode(IDENTITY, payload);
        let (code, digest) = decode(&mh).unwrap();
        assert_eq!(code, IDENTITY);
        assert_eq!(digest, payload);
    }

    #[test]
    fn test_rejects_truncated() {
        let mut mh = encode(IDENTITY, b"abcdef");
        mh.pop();
        assert!(decode(&mh).is_err());
    }

    #[test]
    fn test_rejects_unknown_code() {
        let mh = encode(0x55, b"raw");
        assert!(decode(&mh).is_err());
    }
}
