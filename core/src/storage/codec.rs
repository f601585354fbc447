//! Compression codec seam.

use crate::error::Result;

/// Compresses frame payloads of a store opened with a compression option.
///
/// Codecs are supplied by the caller; the crate ships none.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}
