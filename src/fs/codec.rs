//! Checksummed binary framing for journal and descriptor files.
//!
//! Journals and chunk metas are small and rewritten whole, so each file is a
//! single frame: magic, CRC32 of the payload, then the bincode payload. A
//! frame that fails validation reads as corrupt, which boot discovery treats
//! the same as a missing file.

use crate::{Error, Result};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

const MAGIC: &[u8; 4] = b"LGH1";
const HEADER_LEN: usize = 8;

/// Serialize a value with the standard bincode configuration.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

/// Deserialize a value with the standard bincode configuration.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Encode a value into a checksummed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = to_bytes(value)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a checksummed frame, naming `path` in any corruption error.
pub fn decode_frame<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Corrupt {
            path: path.to_string(),
            reason: "frame shorter than header".to_string(),
        });
    }
    if &bytes[0..4] != MAGIC {
        return Err(Error::Corrupt {
            path: path.to_string(),
            reason: "bad magic".to_string(),
        });
    }
    let expected = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let payload = &bytes[HEADER_LEN..];

    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected {
        return Err(Error::Corrupt {
            path: path.to_string(),
            reason: "checksum mismatch".to_string(),
        });
    }
    from_bytes(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetaFile, TimeRange};

    fn sample_meta() -> MetaFile {
        MetaFile {
            time_range: TimeRange::new(1, 9),
            logs_len: 3,
            offsets: None,
            is_deleted: false,
        }
    }

    #[test]
    fn frame_round_trips() {
        let frame = encode_frame(&sample_meta()).unwrap();
        let decoded: MetaFile = decode_frame("meta", &frame).unwrap();
        assert_eq!(decoded, sample_meta());
    }

    #[test]
    fn corruption_is_detected() {
        let mut frame = encode_frame(&sample_meta()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = decode_frame::<MetaFile>("meta", &frame).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn truncated_frame_is_corrupt() {
        let err = decode_frame::<MetaFile>("meta", b"LG").unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }
}
