use crate::channel::{DownChannel, RingBuffer, UpChannel};
use crate::port::MemoryPort;
use crate::Error;
use std::cmp::min;
use std::ops::Range;

/// Base of the SRAM region scanned by default (Cortex-M convention).
pub const SRAM_BASE: u32 = 0x2000_0000;

/// Bound on the total window scanned for the control block tag.
const SCAN_WINDOW: u32 = 20 * 1024;

/// Size of one chunk read off the target while scanning.
const SCAN_CHUNK: usize = 0x80;

/// The RTT control block interface: one up channel and one down channel behind a tagged
/// descriptor block in target RAM.
///
/// Use [`Rtt::attach`] or [`Rtt::attach_region`] to locate the control block and decode the
/// channels as the target configured them. Attach only after the target firmware has initialized
/// RTT; scanning earlier either finds nothing or decodes stale descriptors left over from a
/// previous firmware image.
#[derive(Debug)]
pub struct Rtt {
    ptr: u32,
    up_channel: UpChannel,
    down_channel: DownChannel,
}

// The control block must follow this data layout when reading/writing memory in order to be
// compatible with the target side implementation.
//
// struct ControlBlock {
//     char id[16];       // Used to find the control block. ASCII tag, not necessarily
//                        // NUL-terminated.
//     struct Descriptor up;    // Target to host channel, see channel.rs for the field layout.
//     struct Descriptor down;  // Host to target channel.
// }

impl Rtt {
    /// The tag expected at the start of the control block identification field.
    pub const RTT_TAG: &'static [u8] = b"SEGGER RTT";

    /// Size of the identification field in target memory.
    const TAG_FIELD_SIZE: u32 = 16;

    /// Combined size of the two channel descriptors following the identification field.
    const DESCRIPTORS_SIZE: usize = 2 * RingBuffer::SIZE;

    /// Scans the default SRAM window for the control block and attaches to it.
    pub fn attach(port: &mut impl MemoryPort) -> Result<Rtt, Error> {
        Self::attach_region(port, &ScanRegion::default())
    }

    /// Scans the given region for the control block and attaches to it.
    pub fn attach_region(port: &mut impl MemoryPort, region: &ScanRegion) -> Result<Rtt, Error> {
        match find_control_block(port, region)? {
            ScanOutcome::Found(ptr) => Self::attach_at(port, ptr),
            ScanOutcome::NotFound => Err(Error::ControlBlockNotFound),
        }
    }

    /// Attaches to a control block at a known address, without scanning and without verifying
    /// the tag.
    ///
    /// This is the explicit degraded mode for callers that decide to proceed after a failed scan,
    /// e.g. `Rtt::attach_at(port, SRAM_BASE)`; the placement is unverified and the decoded
    /// descriptors are only as good as the address.
    pub fn attach_at(port: &mut impl MemoryPort, ptr: u32) -> Result<Rtt, Error> {
        let mut mem = [0u8; Self::DESCRIPTORS_SIZE];
        port.read_8(ptr + Self::TAG_FIELD_SIZE, &mut mem)?;

        let up_ptr = ptr + Self::TAG_FIELD_SIZE;
        let down_ptr = up_ptr + RingBuffer::SIZE as u32;

        let up = RingBuffer::from(up_ptr, &mem[..RingBuffer::SIZE])?;
        let down = RingBuffer::from(down_ptr, &mem[RingBuffer::SIZE..])?;

        tracing::debug!(
            "Attached to control block at {:#010x}: up {} bytes, down {} bytes",
            ptr,
            up.capacity(),
            down.capacity()
        );

        Ok(Rtt {
            ptr,
            up_channel: UpChannel(up),
            down_channel: DownChannel(down),
        })
    }

    /// Returns the memory address of the control block in target memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// The up (target to host) channel.
    pub fn up_channel(&mut self) -> &mut UpChannel {
        &mut self.up_channel
    }

    /// The down (host to target) channel.
    pub fn down_channel(&mut self) -> &mut DownChannel {
        &mut self.down_channel
    }
}

/// Used to specify where to look for the RTT control block.
#[derive(Clone, Debug)]
pub enum ScanRegion {
    /// Scan this address range for the control block tag. It is up to the user to ensure that
    /// reading from the range will not read from undefined memory.
    Range(Range<u32>),

    /// Assume the control block starts at this exact address; no scan, no tag verification.
    Exact(u32),
}

impl Default for ScanRegion {
    /// 20 KiB starting at the Cortex-M SRAM base.
    fn default() -> Self {
        ScanRegion::Range(SRAM_BASE..SRAM_BASE + SCAN_WINDOW)
    }
}

/// Result of scanning for the control block tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanOutcome {
    /// Absolute address of the first byte of the tag.
    Found(u32),

    /// The window was exhausted without a match. A valid terminal state, not an error; callers
    /// decide the fallback policy.
    NotFound,
}

/// Scans `region` for the control block tag in fixed-size chunks.
///
/// Each chunk overlaps the previous one by one byte less than the tag length, so a tag split
/// across a chunk boundary is still found.
pub fn find_control_block(
    port: &mut impl MemoryPort,
    region: &ScanRegion,
) -> Result<ScanOutcome, Error> {
    let range = match region {
        ScanRegion::Exact(addr) => {
            tracing::debug!("Using exact control block address {:#010x}", addr);
            return Ok(ScanOutcome::Found(*addr));
        }
        ScanRegion::Range(range) => range.clone(),
    };

    tracing::debug!("Scanning {:#010x?} for the control block tag", range);

    let step = SCAN_CHUNK - (Rtt::RTT_TAG.len() - 1);
    let mut chunk = [0u8; SCAN_CHUNK];
    let mut addr = range.start;

    while addr < range.end {
        let len = min(SCAN_CHUNK as u32, range.end - addr) as usize;
        port.read_8(addr, &mut chunk[..len])?;

        if let Some(pos) = chunk[..len]
            .windows(Rtt::RTT_TAG.len())
            .position(|window| window == Rtt::RTT_TAG)
        {
            let ptr = addr + pos as u32;
            tracing::debug!("Found control block tag at {:#010x}", ptr);
            return Ok(ScanOutcome::Found(ptr));
        }

        addr += step as u32;
    }

    tracing::debug!("No control block tag in {:#010x?}", range);
    Ok(ScanOutcome::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{control_block_image, MockPort};

    const WINDOW: usize = 20 * 1024;

    #[test]
    fn scan_finds_the_tag_deep_in_the_window() {
        let mut port = MockPort::new(SRAM_BASE, WINDOW);
        port.load(SRAM_BASE + 12_345, Rtt::RTT_TAG);

        assert_eq!(
            find_control_block(&mut port, &ScanRegion::default()).unwrap(),
            ScanOutcome::Found(SRAM_BASE + 12_345)
        );
    }

    #[test]
    fn scan_finds_a_tag_split_across_a_chunk_boundary() {
        // The tag straddles the end of the first 0x80 byte chunk
        let mut port = MockPort::new(SRAM_BASE, WINDOW);
        port.load(SRAM_BASE + 0x7b, Rtt::RTT_TAG);

        assert_eq!(
            find_control_block(&mut port, &ScanRegion::default()).unwrap(),
            ScanOutcome::Found(SRAM_BASE + 0x7b)
        );
    }

    #[test]
    fn scan_reports_an_exhausted_window() {
        let mut port = MockPort::new(SRAM_BASE, WINDOW);

        assert_eq!(
            find_control_block(&mut port, &ScanRegion::default()).unwrap(),
            ScanOutcome::NotFound
        );
    }

    #[test]
    fn exact_region_skips_the_scan() {
        let mut port = MockPort::new(SRAM_BASE, 0x100);

        assert_eq!(
            find_control_block(&mut port, &ScanRegion::Exact(SRAM_BASE + 8)).unwrap(),
            ScanOutcome::Found(SRAM_BASE + 8)
        );
    }

    #[test]
    fn attach_decodes_both_descriptors() {
        let mut port = MockPort::new(SRAM_BASE, WINDOW);
        let cb = SRAM_BASE + 0x40;
        port.load(
            cb,
            &control_block_image(
                [3, 1, 15, 1, SRAM_BASE + 0x100],
                [0, 0, 7, 1, SRAM_BASE + 0x200],
            ),
        );

        let mut rtt = Rtt::attach(&mut port).unwrap();

        assert_eq!(rtt.ptr(), cb);
        assert_eq!(rtt.up_channel().buffer_size(), 16);
        assert!(!rtt.up_channel().is_empty());
        assert_eq!(rtt.down_channel().buffer_size(), 8);
        assert!(!rtt.down_channel().is_full());
    }

    #[test]
    fn attach_rejects_a_non_power_of_two_mask() {
        let mut port = MockPort::new(SRAM_BASE, WINDOW);
        port.load(
            SRAM_BASE,
            &control_block_image(
                [0, 0, 6, 1, SRAM_BASE + 0x100],
                [0, 0, 7, 1, SRAM_BASE + 0x200],
            ),
        );

        assert!(matches!(
            Rtt::attach(&mut port),
            Err(Error::ControlBlockCorrupted(_))
        ));
    }

    #[test]
    fn attach_without_a_tag_reports_not_found() {
        let mut port = MockPort::new(SRAM_BASE, WINDOW);

        assert!(matches!(
            Rtt::attach(&mut port),
            Err(Error::ControlBlockNotFound)
        ));
    }

    #[test]
    fn attach_at_does_not_verify_placement() {
        // Degraded mode: caller decided to assume the RAM base after a failed scan
        let mut port = MockPort::new(SRAM_BASE, 0x400);
        let image = control_block_image([0, 0, 7, 1, SRAM_BASE + 0x100], [0, 0, 7, 1, SRAM_BASE + 0x200]);
        // No tag in front of the descriptors
        port.load(SRAM_BASE + 16, &image[16..]);

        let rtt = Rtt::attach_at(&mut port, SRAM_BASE).unwrap();
        assert_eq!(rtt.ptr(), SRAM_BASE);
    }
}
