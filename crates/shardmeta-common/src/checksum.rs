//! Checksum helpers
//!
//! Stored values and delete-log entries are versioned by the CRC32C of
//! their serialized form, rendered as eight lowercase hex digits.

/// Hex CRC32C of `data`.
#[must_use]
pub fn crc32c_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32c::crc32c(data))
}

/// Store-level etag of a JSON value.
///
/// `serde_json` serializes object keys in a stable order, so equal values
/// always yield equal etags.
#[must_use]
pub fn value_etag(value: &serde_json::Value) -> String {
    crc32c_hex(value.to_string().as_bytes())
}
