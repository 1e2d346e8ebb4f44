//! CBOR encoding of transaction records and log bodies.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Format version of every encoded transaction record.
///
/// Written as the cookie of the transaction log and of the prepared store's
/// region file. Bump it when a serialized type changes shape.
pub const RECORD_FORMAT_VERSION: u64 = 1;

/// Encodes a value as CBOR.
pub(crate) fn encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}
