//! CBOR encoding for tunnel session frames.
//!
//! Wire format: one CBOR value per WebSocket binary message, so unlike a raw
//! byte stream no length prefix is needed.

use crate::error::{GateError, GateResult};
use std::io::Cursor;

/// Maximum encoded size accepted for a single session frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value into a CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> GateResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a typed value.
///
/// Rejects payloads larger than [`MAX_FRAME_SIZE`] before touching them.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> GateResult<T> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(GateError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}
