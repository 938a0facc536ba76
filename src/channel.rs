use crate::port::{MemoryPort, TransportError};
use crate::Error;
use scroll::{Pread, LE};
use std::cmp::min;

/// One channel descriptor of the control block, driven as a single-producer single-consumer ring
/// buffer against remote memory.
///
/// The two offsets advance monotonically in the unmasked 32-bit domain and wrap via unsigned
/// arithmetic. Only their difference (the occupancy) and the masked value (the physical position)
/// are meaningful; the raw offsets are never compared for magnitude.
///
/// The authoritative copy of each offset lives in target memory. This struct holds a cached
/// snapshot which is valid between a `refresh_*` call and the next remote mutation by the peer.
/// `enqueue` and `dequeue` only move the local offsets; pushing an offset back to the target is a
/// separate `publish_*` call, because the timing of publication is a protocol decision, not a
/// buffer mechanics decision.
#[derive(Debug)]
pub(crate) struct RingBuffer {
    /// Remote address of this descriptor inside the control block.
    ptr: u32,
    pub(crate) write_offset: u32,
    pub(crate) read_offset: u32,
    pub(crate) capacity_mask: u32,
    /// Always 1 for byte channels. Retained for format fidelity.
    #[expect(dead_code)]
    pub(crate) element_size: u32,
    pub(crate) buffer_base: u32,
}

// Descriptors must follow this data layout when reading/writing memory in order to be compatible
// with the target side implementation.
//
// struct Descriptor {
//     unsigned int write;  // Offset of the next byte the producer will write, unmasked domain.
//     unsigned int read;   // Offset of the next byte the consumer will read, unmasked domain.
//     unsigned int mask;   // Buffer capacity - 1; capacity is a power of two.
//     unsigned int esize;  // Element size, always 1 for byte channels.
//     void *buffer;        // Address of the first byte of the physical circular buffer.
// }

impl RingBuffer {
    /// Size of one descriptor in target memory in bytes.
    pub(crate) const SIZE: usize = 20;

    // Offsets of fields in target memory in bytes
    const O_WRITE: usize = 0;
    const O_READ: usize = 4;
    const O_MASK: usize = 8;
    const O_ESIZE: usize = 12;
    const O_BUFFER_PTR: usize = 16;

    /// Decodes a descriptor from the raw bytes at `ptr` in target memory.
    ///
    /// `mem` must hold at least [`RingBuffer::SIZE`] bytes; shorter input is a caller error.
    pub(crate) fn from(ptr: u32, mem: &[u8]) -> Result<RingBuffer, Error> {
        let rb = RingBuffer {
            ptr,
            write_offset: mem.pread_with(Self::O_WRITE, LE).unwrap(),
            read_offset: mem.pread_with(Self::O_READ, LE).unwrap(),
            capacity_mask: mem.pread_with(Self::O_MASK, LE).unwrap(),
            element_size: mem.pread_with(Self::O_ESIZE, LE).unwrap(),
            buffer_base: mem.pread_with(Self::O_BUFFER_PTR, LE).unwrap(),
        };

        let capacity = rb.capacity_mask.wrapping_add(1);
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::ControlBlockCorrupted(format!(
                "capacity mask {:#010x} in descriptor at {:#010x} does not describe a power-of-two buffer",
                rb.capacity_mask, ptr
            )));
        }

        Ok(rb)
    }

    /// Physical size of the circular buffer in bytes.
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity_mask.wrapping_add(1)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.write_offset == self.read_offset
    }

    /// Number of bytes currently held, derived from the unsigned offset difference.
    ///
    /// Under correct peer behavior this never exceeds the capacity. That invariant belongs to the
    /// peer firmware and is not enforced here; a stale snapshot only ever under-reports.
    pub(crate) fn occupancy(&self) -> u32 {
        self.write_offset.wrapping_sub(self.read_offset)
    }

    pub(crate) fn free_space(&self) -> u32 {
        let occupancy = self.occupancy();
        debug_assert!(
            occupancy <= self.capacity(),
            "peer advanced the write offset past capacity"
        );
        self.capacity().wrapping_sub(occupancy)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Copies `data` into the buffer at unmasked position `offset`, splitting at the physical end.
    fn copy_in(
        &self,
        port: &mut impl MemoryPort,
        data: &[u8],
        offset: u32,
    ) -> Result<(), TransportError> {
        let offset = offset & self.capacity_mask;
        let first = min(data.len(), (self.capacity() - offset) as usize);

        port.write_8(self.buffer_base + offset, &data[..first])?;
        if data.len() > first {
            // Remainder wraps to the start of the physical buffer
            port.write_8(self.buffer_base, &data[first..])?;
        }

        Ok(())
    }

    /// Copies `len` bytes out of the buffer from unmasked position `offset`.
    fn copy_out(
        &self,
        port: &mut impl MemoryPort,
        len: u32,
        offset: u32,
    ) -> Result<Vec<u8>, TransportError> {
        let offset = offset & self.capacity_mask;
        let first = min(len, self.capacity() - offset) as usize;

        let mut data = vec![0u8; len as usize];
        port.read_8(self.buffer_base + offset, &mut data[..first])?;
        // Zero length when the copy ends exactly at the physical end
        port.read_8(self.buffer_base, &mut data[first..])?;

        Ok(data)
    }

    /// Writes at most `free_space()` bytes of `data` into the buffer and advances the local write
    /// offset by the count actually written, which is returned.
    ///
    /// The tail beyond the free space is dropped silently; that truncation is the designed
    /// backpressure policy of the transport, not an error. The new write offset is not published
    /// to the target.
    pub(crate) fn enqueue(
        &mut self,
        port: &mut impl MemoryPort,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let free = self.free_space() as usize;
        let data = if data.len() > free { &data[..free] } else { data };

        self.copy_in(port, data, self.write_offset)?;
        self.write_offset = self.write_offset.wrapping_add(data.len() as u32);

        Ok(data.len())
    }

    /// Reads up to `max_len` bytes without advancing the read offset.
    pub(crate) fn peek(
        &self,
        port: &mut impl MemoryPort,
        max_len: u32,
    ) -> Result<Vec<u8>, TransportError> {
        let len = min(max_len, self.occupancy());
        self.copy_out(port, len, self.read_offset)
    }

    /// Reads up to `max_len` bytes and advances the local read offset past them.
    ///
    /// The new read offset is not published to the target.
    pub(crate) fn dequeue(
        &mut self,
        port: &mut impl MemoryPort,
        max_len: u32,
    ) -> Result<Vec<u8>, TransportError> {
        let data = self.peek(port, max_len)?;
        self.read_offset = self.read_offset.wrapping_add(data.len() as u32);

        Ok(data)
    }

    pub(crate) fn refresh_write_offset(
        &mut self,
        port: &mut impl MemoryPort,
    ) -> Result<(), TransportError> {
        self.write_offset = port.read_word_32(self.ptr + Self::O_WRITE as u32)?;
        Ok(())
    }

    pub(crate) fn refresh_read_offset(
        &mut self,
        port: &mut impl MemoryPort,
    ) -> Result<(), TransportError> {
        self.read_offset = port.read_word_32(self.ptr + Self::O_READ as u32)?;
        Ok(())
    }

    pub(crate) fn refresh_buffer_base(
        &mut self,
        port: &mut impl MemoryPort,
    ) -> Result<(), TransportError> {
        self.buffer_base = port.read_word_32(self.ptr + Self::O_BUFFER_PTR as u32)?;
        Ok(())
    }

    pub(crate) fn publish_write_offset(
        &self,
        port: &mut impl MemoryPort,
    ) -> Result<(), TransportError> {
        port.write_word_32(self.ptr + Self::O_WRITE as u32, self.write_offset)
    }

    pub(crate) fn publish_read_offset(
        &self,
        port: &mut impl MemoryPort,
    ) -> Result<(), TransportError> {
        port.write_word_32(self.ptr + Self::O_READ as u32, self.read_offset)
    }
}

/// RTT up (target to host) channel. The target produces, the host consumes.
#[derive(Debug)]
pub struct UpChannel(pub(crate) RingBuffer);

impl UpChannel {
    /// Returns the physical buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.0.capacity() as usize
    }

    /// Returns `true` if the cached snapshot shows no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-reads the target-owned fields of this channel: the write offset and the buffer address.
    pub fn refresh(&mut self, port: &mut impl MemoryPort) -> Result<(), Error> {
        self.0.refresh_write_offset(port)?;
        self.0.refresh_buffer_base(port)?;
        Ok(())
    }

    /// Drains the full current occupancy and publishes the advanced read offset.
    ///
    /// Call [`refresh`](UpChannel::refresh) first to pick up bytes the target produced since the
    /// last tick. The offset is published only after the copy completed, so the target never
    /// observes a read offset ahead of bytes actually consumed by the host.
    pub fn read(&mut self, port: &mut impl MemoryPort) -> Result<Vec<u8>, Error> {
        let occupancy = self.0.occupancy();
        if occupancy == 0 {
            return Ok(Vec::new());
        }

        let data = self.0.dequeue(port, occupancy)?;
        self.0.publish_read_offset(port)?;

        Ok(data)
    }

    /// Reads up to `max_len` pending bytes without consuming them.
    pub fn peek(&self, port: &mut impl MemoryPort, max_len: u32) -> Result<Vec<u8>, Error> {
        Ok(self.0.peek(port, max_len)?)
    }
}

/// RTT down (host to target) channel. The host produces, the target consumes.
#[derive(Debug)]
pub struct DownChannel(pub(crate) RingBuffer);

impl DownChannel {
    /// Returns the physical buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.0.capacity() as usize
    }

    /// Returns `true` if the cached snapshot shows no free space.
    pub fn is_full(&self) -> bool {
        self.0.is_full()
    }

    /// Re-reads the target-owned field of this channel: the read offset.
    pub fn refresh(&mut self, port: &mut impl MemoryPort) -> Result<(), Error> {
        self.0.refresh_read_offset(port)?;
        Ok(())
    }

    /// Writes as much of `data` as currently fits and publishes the advanced write offset.
    ///
    /// A full channel rejects the request with a count of 0 and publishes nothing. Anything
    /// beyond the free space is dropped silently. Call [`refresh`](DownChannel::refresh) first to
    /// pick up space the target freed since the last tick.
    pub fn write(&mut self, port: &mut impl MemoryPort, data: &[u8]) -> Result<usize, Error> {
        if self.0.is_full() {
            return Ok(0);
        }

        let written = self.0.enqueue(port, data)?;
        self.0.publish_write_offset(port)?;

        Ok(written)
    }
}
