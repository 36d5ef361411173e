//! Payload codec for bus messages.
//!
//! Messages are `serde` types encoded with `bincode`. The byte layout is an
//! implementation detail; only the message types are a contract.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CamlinkError, Result};

/// Maximum encoded size of a single sample (16 MiB).
pub const MAX_SAMPLE_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message into a sample payload.
pub fn encode<T: Serialize + ?Sized>(msg: &T) -> Result<Bytes> {
    let bytes = bincode::serialize(msg)?;
    if bytes.len() > MAX_SAMPLE_SIZE {
        return Err(CamlinkError::Encoding(format!(
            "sample too large: {} bytes (max {MAX_SAMPLE_SIZE})",
            bytes.len()
        )));
    }
    Ok(Bytes::from(bytes))
}

/// Decode a sample payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.len() > MAX_SAMPLE_SIZE {
        return Err(CamlinkError::Encoding(format!(
            "sample too large: {} bytes (max {MAX_SAMPLE_SIZE})",
            payload.len()
        )));
    }
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_payload_is_an_error() {
        let bytes = encode(&(1u64, 2u64)).unwrap();
        let err = decode::<(u64, u64)>(&bytes[..4]).unwrap_err();
        assert!(matches!(err, CamlinkError::Encoding(_)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = vec![0u8; MAX_SAMPLE_SIZE + 1];
        tokio_test::assert_err!(encode(&big));
        tokio_test::assert_ok!(encode(&big[..16]));
    }
}
