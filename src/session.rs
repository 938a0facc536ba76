//! Session lifecycle and the channel poller.

use crate::port::MemoryPort;
use crate::rtt::{Rtt, ScanRegion};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cadence of the channel poller.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Delay between stopping the poller and handing the port back, so a remote call issued just
/// before the stop flag was observed has settled before the caller closes the probe.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// An open RTT session.
///
/// Owns the polling thread that keeps the up channel drained and the down channel fed, and with
/// it the cached channel descriptors; no other component touches them while the session is open.
/// Constructed by [`Session::open`] and consumed by [`Session::close`], which returns the memory
/// port to the caller. Dropping a session without closing it also stops the poller within one
/// tick, but discards the port. There is no ambient session state.
pub struct Session<P: MemoryPort + Send + 'static> {
    stop: Arc<AtomicBool>,
    host_to_target: Sender<Vec<u8>>,
    target_to_host: Receiver<Vec<u8>>,
    poller: JoinHandle<Result<P, Error>>,
}

impl<P: MemoryPort + Send + 'static> Session<P> {
    /// Locates the control block in `region`, decodes the channel descriptors and starts the
    /// poller.
    pub fn open(mut port: P, region: &ScanRegion) -> Result<Self, Error> {
        let rtt = Rtt::attach_region(&mut port, region)?;
        Ok(Self::start(port, rtt))
    }

    /// Starts the poller against an already attached control block.
    pub fn start(port: P, rtt: Rtt) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (host_tx, host_rx) = mpsc::channel();
        let (target_tx, target_rx) = mpsc::channel();

        let stop_flag = Arc::clone(&stop);
        let poller = thread::spawn(move || poll_loop(port, rtt, stop_flag, host_rx, target_tx));

        Session {
            stop,
            host_to_target: host_tx,
            target_to_host: target_rx,
            poller,
        }
    }

    /// Queues bytes for the down channel.
    ///
    /// The chunk is handed to the poller, which writes it on its next tick. If the down channel
    /// is full at that point the whole chunk is rejected, not queued indefinitely; if only part
    /// of it fits, the tail is dropped.
    pub fn send(&self, data: Vec<u8>) -> Result<(), Error> {
        self.host_to_target
            .send(data)
            .map_err(|_| Error::SessionClosed)
    }

    /// The receiver delivering drained up-channel chunks as they become available.
    ///
    /// Disconnection of this receiver means the poller has terminated; the cause is reported by
    /// [`Session::close`].
    pub fn received(&self) -> &Receiver<Vec<u8>> {
        &self.target_to_host
    }

    /// Stops the poller and returns the memory port so the caller can close the probe.
    ///
    /// The stop flag is honored at the top of the next tick, before any further remote I/O. A
    /// short grace delay elapses before the port is handed back. If the poller terminated on a
    /// link fault, that error is returned instead of the port.
    pub fn close(self) -> Result<P, Error> {
        self.stop.store(true, Ordering::Relaxed);

        let result = match self.poller.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        thread::sleep(CLOSE_GRACE);
        result
    }
}

/// One polling task per session. Runs until the stop flag is raised, the session is dropped, or
/// a remote call fails.
///
/// Per tick, strictly in order: check the stop flag before any remote I/O, refresh the
/// target-owned offsets of both channels, drain the up channel (publishing its read offset only
/// after the bytes are safely local), then service at most one pending send request on the down
/// channel (publishing its write offset only after the bytes are in the buffer).
fn poll_loop<P: MemoryPort>(
    mut port: P,
    mut rtt: Rtt,
    stop: Arc<AtomicBool>,
    host_to_target: Receiver<Vec<u8>>,
    target_to_host: Sender<Vec<u8>>,
) -> Result<P, Error> {
    tracing::debug!("Polling control block at {:#010x}", rtt.ptr());

    loop {
        if stop.load(Ordering::Relaxed) {
            tracing::debug!("Poller stopped");
            return Ok(port);
        }

        rtt.up_channel().refresh(&mut port)?;
        rtt.down_channel().refresh(&mut port)?;

        let data = rtt.up_channel().read(&mut port)?;
        if !data.is_empty() && target_to_host.send(data).is_err() {
            tracing::debug!("Session dropped, poller stopping");
            return Ok(port);
        }

        match host_to_target.try_recv() {
            Ok(data) => {
                let written = rtt.down_channel().write(&mut port, &data)?;
                if written == 0 && !data.is_empty() {
                    tracing::warn!("Down channel full, rejecting {} byte send", data.len());
                }
            }
            Err(TryRecvError::Empty) => {}
            // The Session holds this end until after join(), so disconnection
            // means the session was dropped without close()
            Err(TryRecvError::Disconnected) => {
                tracing::debug!("Session dropped, poller stopping");
                return Ok(port);
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{control_block_image, MockPort};
    use crate::SRAM_BASE;

    const CB: u32 = SRAM_BASE + 0x20;
    const UP_BUF: u32 = SRAM_BASE + 0x100;
    const DOWN_BUF: u32 = SRAM_BASE + 0x200;

    // Descriptor field addresses inside the control block
    const UP_WRITE: u32 = CB + 16;
    const UP_READ: u32 = CB + 20;
    const DOWN_WRITE: u32 = CB + 36;

    fn target_ram() -> MockPort {
        let mut port = MockPort::new(SRAM_BASE, 0x400);
        port.load(
            CB,
            &control_block_image([0, 0, 15, 1, UP_BUF], [0, 0, 15, 1, DOWN_BUF]),
        );
        port
    }

    fn settle() {
        // A handful of ticks is plenty for the poller to act
        thread::sleep(POLL_INTERVAL * 10);
    }

    #[test]
    fn send_enqueues_and_publishes_the_write_offset_once() {
        let port = target_ram();
        let ram = port.clone();

        let session = Session::open(port, &ScanRegion::Exact(CB)).unwrap();
        session.send(b"hi\r".to_vec()).unwrap();
        settle();

        assert_eq!(ram.bytes_at(DOWN_BUF, 3), b"hi\r");
        assert_eq!(
            ram.word_writes()
                .into_iter()
                .filter(|&(addr, _)| addr == DOWN_WRITE)
                .collect::<Vec<_>>(),
            vec![(DOWN_WRITE, 3)]
        );

        session.close().unwrap();
    }

    #[test]
    fn target_output_is_drained_and_acknowledged() {
        let port = target_ram();
        let ram = port.clone();

        let session = Session::open(port, &ScanRegion::Exact(CB)).unwrap();

        // Play the target: produce bytes, then advance the write offset
        ram.load(UP_BUF, b"boot ok\n");
        ram.load(UP_WRITE, &8u32.to_le_bytes());

        let chunk = session
            .received()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(chunk, b"boot ok\n");

        // The read offset trails the drained bytes
        settle();
        assert_eq!(ram.word_at(UP_READ), 8);

        session.close().unwrap();
    }

    #[test]
    fn full_down_channel_rejects_the_chunk() {
        let port = target_ram();
        let ram = port.clone();

        // Occupancy equals capacity: the channel is full
        ram.load(DOWN_WRITE, &16u32.to_le_bytes());

        let session = Session::open(port, &ScanRegion::Exact(CB)).unwrap();
        session.send(b"dropped".to_vec()).unwrap();
        settle();

        assert!(ram
            .word_writes()
            .into_iter()
            .all(|(addr, _)| addr != DOWN_WRITE));

        session.close().unwrap();
    }

    #[test]
    fn close_returns_the_port_and_stops_polling() {
        let port = target_ram();

        let session = Session::open(port, &ScanRegion::Exact(CB)).unwrap();
        settle();

        let ram = session.close().unwrap();
        let quiesced = ram.word_writes().len();
        thread::sleep(POLL_INTERVAL * 5);
        assert_eq!(ram.word_writes().len(), quiesced);
    }

    #[test]
    fn dropping_the_session_stops_the_poller() {
        let port = target_ram();
        let ram = port.clone();

        let session = Session::open(port, &ScanRegion::Exact(CB)).unwrap();
        settle();
        drop(session);
        settle();

        // Produce target output; a leaked poller would drain it and publish the read offset
        ram.load(UP_BUF, b"late");
        ram.load(UP_WRITE, &4u32.to_le_bytes());

        let quiesced = ram.word_writes().len();
        thread::sleep(POLL_INTERVAL * 5);
        assert_eq!(ram.word_writes().len(), quiesced);
        assert_eq!(ram.word_at(UP_READ), 0);
    }

    #[test]
    fn link_fault_terminates_the_poller_and_surfaces_on_close() {
        let port = target_ram();
        let ram = port.clone();

        let session = Session::open(port, &ScanRegion::Exact(CB)).unwrap();
        ram.fail_link();
        settle();

        // The poller is gone: sends are rejected and the subscription is disconnected
        assert!(matches!(
            session.send(b"late".to_vec()),
            Err(Error::SessionClosed)
        ));
        assert!(session.received().recv().is_err());
        assert!(matches!(session.close(), Err(Error::Transport(_))));
    }

    #[test]
    fn open_fails_cleanly_when_the_tag_is_missing() {
        let port = MockPort::new(SRAM_BASE, 0x400);

        assert!(matches!(
            Session::open(port, &ScanRegion::Range(SRAM_BASE..SRAM_BASE + 0x400)),
            Err(Error::ControlBlockNotFound)
        ));
    }
}
