//! Single-producer/single-consumer byte ring carrying variable-length
//! commands.
//!
//! Each command occupies one contiguous slot: an 8-byte header (opcode +
//! total size, both `u32`) followed by the payload, with the total size
//! rounded up to a multiple of 4. Slots never straddle the end of the
//! buffer; when an allocation would cross it, the producer publishes a
//! [`OPCODE_WRAPAROUND`] sentinel consuming the tail exactly and restarts
//! at offset 0. The consumer folds the sentinel away during [`drain`] and
//! never surfaces it.
//!
//! Ordering: payload bytes are made visible by the release store of the
//! write offset in [`publish`], paired with the acquire load in `drain`.
//! The read offset works the same way in the other direction, which is
//! what lets a producer blocked on a full ring observe progress.
//!
//! [`drain`]: CommandRing::drain
//! [`publish`]: CommandRing::publish

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytemuck::{AnyBitPattern, NoUninit};

/// Padding sentinel consuming the tail of the buffer. Internal to the ring.
pub const OPCODE_WRAPAROUND: u32 = 0;
/// Payload is a boxed thunk to run on the worker thread.
pub const OPCODE_ASYNC_CALL: u32 = 1;
/// Re-read the requested renderer and adjust the backend/device.
pub const OPCODE_CHANGE_BACKEND: u32 = 2;
/// Re-read the requested vsync mode and present-throttle flag.
pub const OPCODE_UPDATE_VSYNC: u32 = 3;
/// First opcode handed to the active backend without interpretation.
pub const OPCODE_BACKEND_FIRST: u32 = 16;

pub(crate) const HEADER_SIZE: u32 = 8;

const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Keeps the two offsets on separate cache lines; both sides hammer their
/// own offset and only occasionally load the other.
#[repr(align(64))]
struct PaddedAtomicU32(AtomicU32);

pub struct CommandRing {
    /// Backing store, `u64`-based so offset 0 is 8-aligned and every
    /// 4-aligned slot offset is valid for `u32` header access.
    data: Box<[UnsafeCell<u64>]>,
    capacity: u32,
    read_offset: PaddedAtomicU32,
    write_offset: PaddedAtomicU32,
    wrap_count: AtomicU32,
    /// Debug guard against interleaved unpublished allocations.
    allocation_open: AtomicBool,
}

// SAFETY: the ring is SPSC. The producer only writes bytes inside its
// reserved slot before publishing them with a release store of
// `write_offset`; the consumer only reads bytes at or past the published
// read offset after an acquire load of `write_offset`. The two sides never
// touch the same byte range at the same time, and the offsets themselves
// are atomics.
unsafe impl Sync for CommandRing {}

impl CommandRing {
    /// `capacity` must be a multiple of 8 and large enough to hold at
    /// least one maximal header-only slot plus the wraparound margin.
    pub fn with_capacity(capacity: u32) -> Self {
        assert!(capacity >= 4 * HEADER_SIZE, "ring capacity too small");
        assert_eq!(capacity % 8, 0, "ring capacity must be a multiple of 8");

        let words = (capacity / 8) as usize;
        let mut data = Vec::with_capacity(words);
        data.resize_with(words, || UnsafeCell::new(0));

        Self {
            data: data.into_boxed_slice(),
            capacity,
            read_offset: PaddedAtomicU32(AtomicU32::new(0)),
            write_offset: PaddedAtomicU32(AtomicU32::new(0)),
            wrap_count: AtomicU32::new(0),
            allocation_open: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes published but not yet consumed.
    pub fn pending_bytes(&self) -> u32 {
        let read = self.read_offset.0.load(Ordering::Acquire);
        let write = self.write_offset.0.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    pub fn is_empty(&self) -> bool {
        let write = self.write_offset.0.load(Ordering::Acquire);
        let read = self.read_offset.0.load(Ordering::Relaxed);
        read == write
    }

    /// Number of wraparound sentinels published so far.
    pub fn wrap_count(&self) -> u32 {
        self.wrap_count.load(Ordering::Relaxed)
    }

    fn base_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    /// SAFETY: `offset` must be 4-aligned and `offset + HEADER_SIZE` within
    /// capacity, in a region currently owned by the caller's side.
    unsafe fn write_header(&self, offset: u32, opcode: u32, size: u32) {
        let ptr = self.base_ptr().add(offset as usize) as *mut u32;
        ptr.write(opcode);
        ptr.add(1).write(size);
    }

    /// SAFETY: as for `write_header`, with the slot already published.
    unsafe fn read_header(&self, offset: u32) -> (u32, u32) {
        let ptr = self.base_ptr().add(offset as usize) as *const u32;
        (ptr.read(), ptr.add(1).read())
    }

    /// Reserves a slot for `payload_len` payload bytes. If the ring is too
    /// full, busy-waits, invoking `wake_consumer` each round so a sleeping
    /// consumer makes progress. Panics on a request that can never fit.
    pub fn allocate<'a>(
        &'a self,
        opcode: u32,
        payload_len: usize,
        wake_consumer: &dyn Fn(),
    ) -> SlotWriter<'a> {
        let payload_len = u32::try_from(payload_len).expect("command payload too large");
        let size = HEADER_SIZE + align_up(payload_len, 4);
        assert!(
            size + HEADER_SIZE <= self.capacity,
            "command of {size} bytes can never fit a {} byte ring",
            self.capacity
        );
        debug_assert!(
            !self.allocation_open.swap(true, Ordering::Relaxed),
            "allocated a second slot with one still unpublished"
        );

        loop {
            let read = self.read_offset.0.load(Ordering::Acquire);
            let write = self.write_offset.0.load(Ordering::Relaxed);

            if read > write {
                // Free region is [write, read). Keep a header-sized gap so
                // the write offset never catches up to the read offset.
                if read - write < size + HEADER_SIZE {
                    wake_consumer();
                    std::hint::spin_loop();
                    continue;
                }
            } else {
                let available = self.capacity - write;
                if size + HEADER_SIZE > available {
                    if read == 0 {
                        // Wrapping now would set the write offset to the
                        // read offset and make the pending tail look like
                        // an empty ring. Wait for the consumer to move.
                        wake_consumer();
                        std::hint::spin_loop();
                        continue;
                    }
                    // SAFETY: [write, capacity) is unpublished producer
                    // territory and `write` is 4-aligned.
                    unsafe { self.write_header(write, OPCODE_WRAPAROUND, available) };
                    self.write_offset.0.store(0, Ordering::Release);
                    self.wrap_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            return SlotWriter {
                ring: self,
                offset: write,
                opcode,
                size,
                payload_len,
            };
        }
    }

    /// Publishes an allocated slot, making it visible to the consumer.
    pub fn publish(&self, slot: SlotWriter<'_>) {
        // SAFETY: the slot region was reserved by `allocate` and the
        // producer has finished writing it.
        unsafe { self.write_header(slot.offset, slot.opcode, slot.size) };
        let new_write = self
            .write_offset
            .0
            .fetch_add(slot.size, Ordering::Release)
            + slot.size;
        debug_assert!(new_write < self.capacity);
        debug_assert!(self.allocation_open.swap(false, Ordering::Relaxed));
    }

    /// Consumer-side batch over everything published so far. Call
    /// [`Drain::next`] until it returns `None`, then [`Drain::finish`].
    pub fn drain(&self) -> Drain<'_> {
        let write = self.write_offset.0.load(Ordering::Acquire);
        let read = self.read_offset.0.load(Ordering::Relaxed);
        Drain {
            ring: self,
            read,
            limit: if write < read { self.capacity } else { write },
        }
    }
}

/// A reserved, not yet published slot. The payload is written in place.
pub struct SlotWriter<'a> {
    ring: &'a CommandRing,
    offset: u32,
    opcode: u32,
    size: u32,
    payload_len: u32,
}

impl SlotWriter<'_> {
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// The unpadded payload region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: the region [offset + HEADER_SIZE, offset + size) was
        // reserved by `allocate` and is exclusively ours until `publish`.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ring
                    .base_ptr()
                    .add((self.offset + HEADER_SIZE) as usize),
                self.payload_len as usize,
            )
        }
    }

    /// Copies a plain-old-data value to the start of the payload.
    pub fn write_payload<T: NoUninit>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        self.payload_mut()[..bytes.len()].copy_from_slice(bytes);
    }
}

/// One published command as seen by the consumer.
pub struct CommandSlot<'a> {
    pub opcode: u32,
    payload: &'a [u8],
}

impl<'a> CommandSlot<'a> {
    /// Payload bytes, padded to a multiple of 4.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn read_payload<T: AnyBitPattern>(&self) -> T {
        bytemuck::pod_read_unaligned(&self.payload[..std::mem::size_of::<T>()])
    }
}

/// Consumer-side drain over one published batch.
///
/// Wraparound sentinels are consumed internally: the local cursor resets
/// to 0, the new read offset is published immediately (so a producer
/// blocked on a full ring sees the space), and the write limit is
/// re-acquired.
pub struct Drain<'a> {
    ring: &'a CommandRing,
    read: u32,
    limit: u32,
}

impl<'a> Drain<'a> {
    pub fn next(&mut self) -> Option<CommandSlot<'_>> {
        loop {
            if self.read == self.limit {
                return None;
            }

            // SAFETY: [read, limit) is published and owned by the consumer.
            let (opcode, size) = unsafe { self.ring.read_header(self.read) };
            debug_assert!(size >= HEADER_SIZE && size % 4 == 0);
            debug_assert!(self.read + size <= self.ring.capacity);
            let payload_offset = self.read + HEADER_SIZE;
            let payload_len = size - HEADER_SIZE;
            self.read += size;

            if opcode == OPCODE_WRAPAROUND {
                debug_assert_eq!(self.read, self.ring.capacity);
                self.read = 0;
                // Let the producer know as early as possible that the tail
                // has been reclaimed.
                self.ring.read_offset.0.store(0, Ordering::Release);
                self.limit = self.ring.write_offset.0.load(Ordering::Acquire);
                continue;
            }

            // SAFETY: the payload lies inside the published region and the
            // borrow of `self` keeps it alive only until the next call.
            let payload = unsafe {
                std::slice::from_raw_parts(
                    self.ring.base_ptr().add(payload_offset as usize),
                    payload_len as usize,
                )
            };
            return Some(CommandSlot { opcode, payload });
        }
    }

    /// Publishes the final read offset for this batch.
    pub fn finish(self) {
        self.ring.read_offset.0.store(self.read, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_wake() -> impl Fn() {
        || {}
    }

    fn push_bytes(ring: &CommandRing, opcode: u32, bytes: &[u8]) {
        let mut slot = ring.allocate(opcode, bytes.len(), &no_wake());
        slot.payload_mut().copy_from_slice(bytes);
        ring.publish(slot);
    }

    fn drain_all(ring: &CommandRing) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        let mut drain = ring.drain();
        while let Some(cmd) = drain.next() {
            out.push((cmd.opcode, cmd.payload().to_vec()));
        }
        drain.finish();
        out
    }

    #[test]
    fn commands_come_out_in_publication_order() {
        let ring = CommandRing::with_capacity(1024);
        for i in 0..10u8 {
            push_bytes(&ring, OPCODE_BACKEND_FIRST + u32::from(i), &[i, i, i, i]);
        }

        let drained = drain_all(&ring);
        assert_eq!(drained.len(), 10);
        for (i, (opcode, payload)) in drained.iter().enumerate() {
            assert_eq!(*opcode, OPCODE_BACKEND_FIRST + i as u32);
            assert_eq!(payload, &vec![i as u8; 4]);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn payload_sizes_round_up_to_four_bytes() {
        let ring = CommandRing::with_capacity(256);
        push_bytes(&ring, OPCODE_BACKEND_FIRST, &[1, 2, 3]);
        let drained = drain_all(&ring);
        // The consumer sees the padded region; the payload prefix is intact.
        assert_eq!(drained[0].1.len(), 4);
        assert_eq!(&drained[0].1[..3], &[1, 2, 3]);
    }

    #[test]
    fn wraparound_preserves_bytes_and_is_never_surfaced() {
        // 300 commands of 12 bytes each through a 1 KiB ring forces many
        // wraps; interleave progress so the producer never stalls.
        let ring = CommandRing::with_capacity(1024);
        let mut received = Vec::new();

        let mut pushed = 0u32;
        while pushed < 300 {
            // Keep well under capacity; with no concurrent consumer, a
            // full ring would busy-wait forever.
            while pushed < 300 && ring.pending_bytes() < 256 {
                push_bytes(&ring, OPCODE_BACKEND_FIRST, &pushed.to_le_bytes());
                pushed += 1;
            }
            for (opcode, payload) in drain_all(&ring) {
                assert_ne!(opcode, OPCODE_WRAPAROUND);
                received.push(u32::from_le_bytes(payload[..4].try_into().unwrap()));
            }
        }
        received.extend(
            drain_all(&ring)
                .iter()
                .map(|(_, p)| u32::from_le_bytes(p[..4].try_into().unwrap())),
        );

        assert_eq!(received, (0..300).collect::<Vec<_>>());
        assert!(ring.wrap_count() >= 1);
        assert!(ring.is_empty());
        assert_eq!(ring.pending_bytes(), 0);
    }

    #[test]
    fn pod_payload_round_trip() {
        #[repr(C)]
        #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
        struct FillRect {
            x: u32,
            y: u32,
            width: u32,
            height: u32,
            color: u32,
        }

        let rect = FillRect {
            x: 16,
            y: 32,
            width: 640,
            height: 480,
            color: 0x00ff_00ff,
        };

        let ring = CommandRing::with_capacity(256);
        let mut slot = ring.allocate(OPCODE_BACKEND_FIRST, std::mem::size_of::<FillRect>(), &no_wake());
        slot.write_payload(&rect);
        ring.publish(slot);

        let mut drain = ring.drain();
        let cmd = drain.next().unwrap();
        assert_eq!(cmd.read_payload::<FillRect>(), rect);
        assert!(drain.next().is_none());
        drain.finish();
    }

    #[test]
    fn full_ring_waits_for_consumer_progress() {
        let ring = CommandRing::with_capacity(64);
        // One 40-byte slot fills the ring past the point where a second one
        // can be reserved without the consumer making room.
        push_bytes(&ring, OPCODE_BACKEND_FIRST, &[0u8; 32]);

        let woke = AtomicU32::new(0);
        std::thread::scope(|scope| {
            let consumer = scope.spawn(|| {
                // Give the producer a moment to hit the busy-wait path,
                // then keep draining until the blocked push lands.
                std::thread::sleep(std::time::Duration::from_millis(20));
                let mut received = Vec::new();
                while received.len() < 2 {
                    received.extend(drain_all(&ring));
                    std::hint::spin_loop();
                }
                received
            });

            let wake = || {
                woke.fetch_add(1, Ordering::Relaxed);
            };
            let mut slot = ring.allocate(OPCODE_BACKEND_FIRST, 32, &wake);
            slot.payload_mut().copy_from_slice(&[1u8; 32]);
            ring.publish(slot);

            let received = consumer.join().unwrap();
            assert_eq!(received.len(), 2);
            assert_eq!(received[1].1, vec![1u8; 32]);
        });

        assert!(woke.load(Ordering::Relaxed) > 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn spsc_stress_delivers_everything_in_order() {
        const COUNT: u32 = 50_000;
        let ring = CommandRing::with_capacity(512);

        std::thread::scope(|scope| {
            let consumer = scope.spawn(|| {
                let mut expected = 0u32;
                while expected < COUNT {
                    let mut drain = ring.drain();
                    while let Some(cmd) = drain.next() {
                        assert_eq!(cmd.read_payload::<u32>(), expected);
                        expected += 1;
                    }
                    drain.finish();
                    std::hint::spin_loop();
                }
                expected
            });

            for i in 0..COUNT {
                let mut slot = ring.allocate(OPCODE_BACKEND_FIRST, 4, &|| {});
                slot.write_payload(&i);
                ring.publish(slot);
            }

            assert_eq!(consumer.join().unwrap(), COUNT);
        });

        assert!(ring.is_empty());
        assert!(ring.wrap_count() > 0);
    }

    #[test]
    #[should_panic(expected = "can never fit")]
    fn oversized_command_is_a_programmer_error() {
        let ring = CommandRing::with_capacity(64);
        let _ = ring.allocate(OPCODE_BACKEND_FIRST, 64, &|| {});
    }
}
