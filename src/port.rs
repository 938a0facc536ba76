//! Remote memory access over the debug link.

use thiserror::Error;

/// Byte addressable access to target memory over a debug link.
///
/// Implementations wrap the actual probe transport (J-Link DLL, CMSIS-DAP, ...); the transport
/// core only ever issues these four primitives. Transfers are synchronous and may block for the
/// duration of the physical operation. Zero-length transfers must succeed without touching the
/// link, because a ring buffer copy that exactly reaches the physical end of the buffer issues a
/// zero-length transfer for the wrap segment.
pub trait MemoryPort {
    /// Reads `data.len()` bytes from target memory starting at `address`.
    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), TransportError>;

    /// Writes all of `data` to target memory starting at `address`.
    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Reads one little-endian 32-bit word from `address`.
    fn read_word_32(&mut self, address: u32) -> Result<u32, TransportError>;

    /// Writes one little-endian 32-bit word to `address`.
    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), TransportError>;
}

/// A fault on the debug link, e.g. the probe was disconnected mid-transfer.
///
/// Fatal to the session that observes it. Retry policy, if any, belongs to the port
/// implementation; the transport core propagates the first fault and tears down.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl TransportError {
    /// Wraps an underlying link error.
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        TransportError(source.into())
    }
}
