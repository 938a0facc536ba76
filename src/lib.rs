//! Host side implementation of the RTT (Real-Time Transfer) console transport.
//!
//! RTT implements input and output to/from a microcontroller using in-memory ring buffers and
//! memory polling. The target firmware places a control block at a fixed layout in RAM; the host
//! finds it through the debug probe and exchanges bytes with the target through two
//! single-producer single-consumer circular buffers, without any clock or interrupt coordination.
//!
//! This crate implements the transport only: locating the control block, decoding its channel
//! descriptors, the ring buffer algorithm against remote memory, and the polling loop that keeps
//! the up channel drained and the down channel fed. The probe link itself is abstracted as the
//! [`MemoryPort`] trait; anything that can read and write target memory can drive a session.
//!
//! ## Example
//!
//! ```no_run
//! use rtt_console::{MemoryPort, ScanRegion, Session};
//!
//! fn run(port: impl MemoryPort + Send + 'static) -> Result<(), rtt_console::Error> {
//!     // Locate the control block and start the poller
//!     let session = Session::open(port, &ScanRegion::default())?;
//!
//!     // Bytes drained from the up channel arrive as chunks
//!     if let Ok(chunk) = session.received().recv() {
//!         println!("target says: {}", String::from_utf8_lossy(&chunk));
//!     }
//!
//!     // Feed the down channel
//!     session.send(b"hi\r".to_vec())?;
//!
//!     // Stop polling and get the port back before closing the probe
//!     let _port = session.close()?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

mod channel;
pub use channel::*;

mod port;
pub use port::*;

mod rtt;
pub use rtt::*;

mod session;
pub use session::*;


/// Error type for RTT operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The control block tag was not found within the scan window.
    #[error(
        "RTT control block not found in target memory.\n\
        - Make sure RTT is initialized on the target, AND that the scan region covers the control block.\n\
        - If the target places the control block at a known address, attach to it directly with `Rtt::attach_at`."
    )]
    ControlBlockNotFound,

    /// The control block describes a channel this implementation cannot drive. The data contains
    /// a detailed error.
    #[error("Control block corrupted: {0}")]
    ControlBlockCorrupted(String),

    /// Wraps a fault on the debug link. Fatal to the session that observes it; the transport
    /// never retries on its own.
    #[error("Error communicating with probe: {0}")]
    Transport(#[from] TransportError),

    /// The poller has terminated. The cause is reported by [`Session::close`].
    #[error("RTT session is closed")]
    SessionClosed,
}
