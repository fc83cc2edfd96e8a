//! Multi-process ring buffer of length-prefixed word records
//!
//! [`SharedEventBuffer`] lays a mutex, a condition variable, a
//! [`RingHeader`] and a circular data region out in one named segment (see
//! [`crate::header`]). Any number of writer and reader processes attach by
//! name; every mutation happens under the embedded mutex and is followed by
//! a broadcast, so blocked peers re-check their predicates.
//!
//! Records are stored as `[len][len × u32]` at `words_in % capacity`.
//! Readers consume them in commit order and each record goes to exactly one
//! reader.

use crate::circular::{copy_into, copy_out, set_word_at, word_at};
use crate::error::{ShmError, ShmResult};
use crate::header::{
    COND_OFFSET, DATA_OFFSET, HEADER_OFFSET, HeaderSnapshot, MUTEX_OFFSET, RING_MAGIC,
    RingHeader, RunInfo, capacity_for_size, segment_size,
};
use crate::segment::SharedMemory;
use crate::sync::{LockState, MutexGuard, ProcessCond, ProcessMutex};
use evbuf::consts::DEFAULT_ATTACH_TIMEOUT_MS;
use evbuf::shm::consts::{MAX_CAPACITY_WORDS, MIN_CAPACITY_WORDS, SHM_MAX_SIZE};
use nix::errno::Errno;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Options for [`SharedEventBuffer::open_with`]
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Unlink and re-create the segment even if it exists
    pub recreate: bool,
    /// Create the embedded mutex as a robust mutex (creator only)
    pub robust: bool,
    /// How long an attacher waits for the creator to finish initialisation
    pub attach_timeout: Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            recreate: false,
            robust: true,
            attach_timeout: Duration::from_millis(DEFAULT_ATTACH_TIMEOUT_MS),
        }
    }
}

/// Result of a successful read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadInfo {
    /// Sequence number of the record (`count_out` after the read)
    pub count: u32,
    /// Payload words copied out
    pub words: usize,
    /// Header as it was right after the read
    pub header: HeaderSnapshot,
}

/// Handle on a shared ring buffer segment.
///
/// The handle is `Send + Sync`; threads of one process may share it the
/// same way separate processes share the segment.
pub struct SharedEventBuffer {
    shm: SharedMemory,
    capacity_words: usize,
    base: NonNull<u8>,
}

// SAFETY: all access to the mapped bytes goes through the process-shared
// mutex, which serialises threads as well as processes.
unsafe impl Send for SharedEventBuffer {}
unsafe impl Sync for SharedEventBuffer {}

impl SharedEventBuffer {
    /// Create or attach the ring `name` with `capacity_words` data words.
    pub fn open(name: &str, capacity_words: usize, recreate: bool) -> ShmResult<Self> {
        Self::open_with(
            name,
            capacity_words,
            BufferOptions {
                recreate,
                ..Default::default()
            },
        )
    }

    /// Create or attach with explicit options.
    ///
    /// The creating process initialises the primitives and the header and
    /// publishes the header magic last. Attaching processes wait up to
    /// `attach_timeout` for the magic and then verify the capacity.
    pub fn open_with(name: &str, capacity_words: usize, options: BufferOptions) -> ShmResult<Self> {
        let size = match segment_size(capacity_words) {
            Some(size)
                if size <= SHM_MAX_SIZE
                    && (MIN_CAPACITY_WORDS..=MAX_CAPACITY_WORDS).contains(&capacity_words) =>
            {
                size
            }
            _ => return Err(ShmError::InvalidCapacity { capacity_words }),
        };

        let mut shm = match SharedMemory::open(name, size, options.recreate) {
            Ok(shm) => shm,
            Err(ShmError::SizeMismatch { found, .. }) => {
                return Err(ShmError::CapacityMismatch {
                    name: name.to_string(),
                    expected: capacity_words,
                    found: capacity_for_size(found).unwrap_or(0),
                });
            }
            Err(e) => return Err(e),
        };
        let base = shm.map(0, size)?;

        let ring = Self {
            shm,
            capacity_words,
            base,
        };

        if ring.shm.is_created() {
            ring.initialize(options.robust)?;
            info!(
                "Created ring {} ({} words, robust={})",
                name, capacity_words, options.robust
            );
        } else {
            ring.await_ready(options.attach_timeout)?;
            debug!("Attached ring {} ({} words)", name, capacity_words);
        }
        Ok(ring)
    }

    fn initialize(&self, robust: bool) -> ShmResult<()> {
        self.mutex().init(robust)?;
        self.cond().init()?;
        // SAFETY: the segment was just created by this process; no other
        // process uses it before the magic is published below.
        let header = unsafe { &mut *self.header_ptr() };
        header.reset();
        header.capacity_words = self.capacity_words as u64;
        header.magic.store(RING_MAGIC, Ordering::Release);
        Ok(())
    }

    fn await_ready(&self, timeout: Duration) -> ShmResult<()> {
        let deadline = Instant::now() + timeout;
        // SAFETY: magic is atomic; other header fields are only read after
        // the Acquire load observes the creator's Release store.
        let magic = unsafe { &(*self.header_ptr()).magic };
        while magic.load(Ordering::Acquire) != RING_MAGIC {
            if Instant::now() >= deadline {
                return Err(ShmError::NotInitialized {
                    name: self.shm.name().to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let found = unsafe { (*self.header_ptr()).capacity_words } as usize;
        if found != self.capacity_words {
            return Err(ShmError::CapacityMismatch {
                name: self.shm.name().to_string(),
                expected: self.capacity_words,
                found,
            });
        }
        Ok(())
    }

    /// Append one record, blocking until it can be committed.
    ///
    /// Without `force` the writer also waits while a reader is counted as
    /// active. Every copy here runs under the mutex and waiters drop out of
    /// the counts, so with this crate's peers the counts are never seen
    /// non-zero and `force` changes nothing; it is kept so callers written
    /// against the activity-count protocol keep their signatures.
    /// With `serial` the record is only committed once `count_in + 1 ==
    /// serial`, which orders concurrent writers. Returns the record's
    /// sequence number.
    pub fn write(&self, record: &[u32], force: bool, serial: Option<u32>) -> ShmResult<u32> {
        self.check_record(record.len())?;
        let mut locked = self.acquire()?;
        locked
            .write(record, force, serial, None)?
            .ok_or_else(|| ShmError::sync("pthread_cond_wait", libc::ETIMEDOUT))
    }

    /// Like [`write`](Self::write) but gives up after `timeout`.
    ///
    /// Returns `Ok(None)` if the record could not be committed in time; the
    /// ring is unchanged in that case.
    pub fn write_timeout(
        &self,
        record: &[u32],
        force: bool,
        serial: Option<u32>,
        timeout: Duration,
    ) -> ShmResult<Option<u32>> {
        self.check_record(record.len())?;
        let deadline = Instant::now() + timeout;
        let mut locked = self.acquire()?;
        locked.write(record, force, serial, Some(deadline))
    }

    /// Remove the oldest record into `buf`, blocking until one is complete.
    ///
    /// Fails with `BufferTooSmall` (leaving the record in place) if `buf`
    /// is shorter than the record.
    /// `force` mirrors [`write`](Self::write): it skips the active-writer
    /// check, which never triggers between handles of this crate.
    pub fn read(&self, buf: &mut [u32], force: bool) -> ShmResult<ReadInfo> {
        let mut locked = self.acquire()?;
        locked
            .read(RecordSink::Slice(buf), force, None)?
            .ok_or_else(|| ShmError::sync("pthread_cond_wait", libc::ETIMEDOUT))
    }

    /// Like [`read`](Self::read) but gives up after `timeout`.
    pub fn read_timeout(
        &self,
        buf: &mut [u32],
        force: bool,
        timeout: Duration,
    ) -> ShmResult<Option<ReadInfo>> {
        let deadline = Instant::now() + timeout;
        let mut locked = self.acquire()?;
        locked.read(RecordSink::Slice(buf), force, Some(deadline))
    }

    /// Remove the oldest record into a freshly sized vector.
    pub fn read_record(&self, force: bool) -> ShmResult<(Vec<u32>, ReadInfo)> {
        let mut out = Vec::new();
        let mut locked = self.acquire()?;
        let info = locked
            .read(RecordSink::Vec(&mut out), force, None)?
            .ok_or_else(|| ShmError::sync("pthread_cond_wait", libc::ETIMEDOUT))?;
        Ok((out, info))
    }

    /// Like [`read_record`](Self::read_record) but gives up after `timeout`.
    pub fn read_record_timeout(
        &self,
        force: bool,
        timeout: Duration,
    ) -> ShmResult<Option<(Vec<u32>, ReadInfo)>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut locked = self.acquire()?;
        let info = locked.read(RecordSink::Vec(&mut out), force, Some(deadline))?;
        Ok(info.map(|info| (out, info)))
    }

    /// Whether a record of `n_words` payload words would fit right now.
    pub fn is_writable(&self, n_words: usize) -> ShmResult<bool> {
        let mut locked = self.acquire()?;
        Ok(locked.has_room(n_words))
    }

    /// Whether a complete record of at least `n_words` words is waiting.
    ///
    /// `n_words == 0` asks whether any record is readable.
    pub fn is_readable(&self, n_words: usize) -> ShmResult<bool> {
        let mut locked = self.acquire()?;
        Ok(locked
            .next_record_len()
            .is_some_and(|len| len as usize >= n_words))
    }

    /// Zero the header counters, run info and the whole data region.
    ///
    /// Administrative reset between runs; not meant to race live peers.
    pub fn clear(&self) -> ShmResult<()> {
        let mut locked = self.acquire()?;
        locked.header().reset();
        locked.data().fill(0);
        debug!("Cleared ring {}", self.shm.name());
        Ok(())
    }

    /// Consistent copy of the header.
    pub fn header(&self) -> ShmResult<HeaderSnapshot> {
        let mut locked = self.acquire()?;
        Ok(locked.header().snapshot())
    }

    /// Store run identification in the header.
    pub fn set_run(&self, run: RunInfo) -> ShmResult<()> {
        let mut locked = self.acquire()?;
        locked.header().set_run(run);
        info!(
            "Ring {} now exp {} run {} subrun {}",
            self.shm.name(),
            run.exp_number,
            run.run_number,
            run.subrun_number
        );
        Ok(())
    }

    /// Take the ring mutex for a batch of non-blocking operations.
    pub fn lock(&self) -> ShmResult<BufferGuard<'_>> {
        Ok(BufferGuard {
            locked: self.acquire()?,
        })
    }

    /// Remove the segment name. Attached processes keep working.
    pub fn unlink(&self) -> ShmResult<bool> {
        self.shm.unlink()
    }

    /// Remove the segment name `name` without attaching.
    pub fn unlink_name(name: &str) -> ShmResult<bool> {
        SharedMemory::unlink_name(name)
    }

    /// Unmap from this process.
    pub fn close(mut self) {
        self.shm.close();
    }

    /// Segment name
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Data-region capacity in words
    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    /// Largest payload a single record may carry.
    pub fn max_record_words(&self) -> usize {
        self.capacity_words - 2
    }

    /// Whether this handle created the segment
    pub fn is_creator(&self) -> bool {
        self.shm.is_created()
    }

    fn check_record(&self, n_words: usize) -> ShmResult<()> {
        if n_words == 0 {
            return Err(ShmError::EmptyRecord);
        }
        if n_words > self.max_record_words() {
            return Err(ShmError::RecordTooLarge {
                words: n_words,
                max: self.max_record_words(),
            });
        }
        Ok(())
    }

    fn acquire(&self) -> ShmResult<Locked<'_>> {
        let (guard, state) = self.mutex().lock().map_err(|e| self.map_lock_error(e))?;
        let mut locked = Locked { ring: self, guard };
        if state == LockState::OwnerDied {
            locked.recover();
        }
        Ok(locked)
    }

    fn map_lock_error(&self, error: ShmError) -> ShmError {
        match error {
            ShmError::Sync {
                source: Errno::ENOTRECOVERABLE,
                ..
            } => ShmError::LockNotRecoverable {
                name: self.shm.name().to_string(),
            },
            other => other,
        }
    }

    fn mutex(&self) -> &ProcessMutex {
        // SAFETY: MUTEX_OFFSET lies inside the mapping, which lives as long as self.
        unsafe { ProcessMutex::from_ptr(self.base.as_ptr().add(MUTEX_OFFSET)) }
    }

    fn cond(&self) -> &ProcessCond {
        // SAFETY: as above.
        unsafe { ProcessCond::from_ptr(self.base.as_ptr().add(COND_OFFSET)) }
    }

    fn header_ptr(&self) -> *mut RingHeader {
        // SAFETY: HEADER_OFFSET is 64-aligned and inside the mapping.
        unsafe { self.base.as_ptr().add(HEADER_OFFSET) as *mut RingHeader }
    }

    fn data_ptr(&self) -> *mut u32 {
        // SAFETY: DATA_OFFSET is 64-aligned; capacity words follow it.
        unsafe { self.base.as_ptr().add(DATA_OFFSET) as *mut u32 }
    }
}

impl std::fmt::Debug for SharedEventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEventBuffer")
            .field("name", &self.shm.name())
            .field("capacity_words", &self.capacity_words)
            .field("creator", &self.shm.is_created())
            .finish()
    }
}

/// Held ring mutex for batched operations.
///
/// Operations through the guard never wait: they return `Ok(None)` when
/// there is no room or no complete record. Peers are woken when the guard
/// is dropped.
pub struct BufferGuard<'a> {
    locked: Locked<'a>,
}

impl BufferGuard<'_> {
    /// Append a record if it fits now.
    pub fn try_write(&mut self, record: &[u32], serial: Option<u32>) -> ShmResult<Option<u32>> {
        self.locked.ring.check_record(record.len())?;
        self.locked.write(record, true, serial, Some(Instant::now()))
    }

    /// Remove the oldest record into `buf` if one is complete.
    pub fn try_read(&mut self, buf: &mut [u32]) -> ShmResult<Option<ReadInfo>> {
        self.locked
            .read(RecordSink::Slice(buf), true, Some(Instant::now()))
    }

    /// Remove the oldest record into a new vector if one is complete.
    pub fn try_read_record(&mut self) -> ShmResult<Option<(Vec<u32>, ReadInfo)>> {
        let mut out = Vec::new();
        let info = self
            .locked
            .read(RecordSink::Vec(&mut out), true, Some(Instant::now()))?;
        Ok(info.map(|info| (out, info)))
    }

    /// Header as seen under the held lock.
    pub fn header(&mut self) -> HeaderSnapshot {
        self.locked.header().snapshot()
    }

    /// Store run identification.
    pub fn set_run(&mut self, run: RunInfo) {
        self.locked.header().set_run(run);
    }
}

#[derive(Clone, Copy)]
enum Role {
    Writer,
    Reader,
}

enum RecordSink<'b> {
    Slice(&'b mut [u32]),
    Vec(&'b mut Vec<u32>),
}

/// Ring mutex held by this thread; broadcasts on release.
struct Locked<'a> {
    ring: &'a SharedEventBuffer,
    guard: MutexGuard<'a>,
}

impl Locked<'_> {
    fn header(&mut self) -> &mut RingHeader {
        // SAFETY: the ring mutex is held for the lifetime of self.
        unsafe { &mut *self.ring.header_ptr() }
    }

    fn data(&mut self) -> &mut [u32] {
        // SAFETY: as above; the data region holds capacity_words words.
        unsafe { std::slice::from_raw_parts_mut(self.ring.data_ptr(), self.ring.capacity_words) }
    }

    /// Reset the activity counts after a holder died mid-operation.
    fn recover(&mut self) {
        let name = self.ring.shm.name().to_string();
        let header = self.header();
        warn!(
            "Ring {}: lock owner died (writers={}, readers={}); resetting activity counts",
            name, header.writer_count, header.reader_count
        );
        header.writer_count = 0;
        header.reader_count = 0;
    }

    fn enter(&mut self, role: Role) {
        let header = self.header();
        match role {
            Role::Writer => header.writer_count += 1,
            Role::Reader => header.reader_count += 1,
        }
    }

    fn leave(&mut self, role: Role) {
        let header = self.header();
        match role {
            Role::Writer => header.writer_count = header.writer_count.saturating_sub(1),
            Role::Reader => header.reader_count = header.reader_count.saturating_sub(1),
        }
    }

    /// Wait for a broadcast while not counted as active.
    ///
    /// Returns `false` once `deadline` has passed.
    fn wait(&mut self, role: Role, deadline: Option<Instant>) -> ShmResult<bool> {
        let remaining = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                Some(remaining)
            }
            None => None,
        };

        self.leave(role);
        let cond = self.ring.cond();
        let waited = match remaining {
            Some(remaining) => cond.wait_timeout(&mut self.guard, remaining),
            None => cond.wait(&mut self.guard),
        };
        let state = waited.map_err(|e| self.ring.map_lock_error(e))?;
        if state == LockState::OwnerDied {
            self.recover();
        }
        self.enter(role);
        Ok(true)
    }

    fn has_room(&mut self, n_words: usize) -> bool {
        let needed = n_words as u64 + 1;
        let capacity = self.ring.capacity_words as u64;
        needed < capacity && self.header().buffered_words() < capacity - needed
    }

    /// Payload length of the next record if it is completely committed.
    fn next_record_len(&mut self) -> Option<u32> {
        let header = self.header();
        let buffered = header.buffered_words();
        let words_out = header.words_out;
        if buffered == 0 {
            return None;
        }
        let len = word_at(self.data(), words_out);
        (len > 0 && buffered > len as u64).then_some(len)
    }

    fn write(
        &mut self,
        record: &[u32],
        force: bool,
        serial: Option<u32>,
        deadline: Option<Instant>,
    ) -> ShmResult<Option<u32>> {
        self.enter(Role::Writer);
        let result = self.write_entered(record, force, serial, deadline);
        self.leave(Role::Writer);
        result
    }

    fn write_entered(
        &mut self,
        record: &[u32],
        force: bool,
        serial: Option<u32>,
        deadline: Option<Instant>,
    ) -> ShmResult<Option<u32>> {
        loop {
            let header = self.header();
            let reader_busy = !force && header.reader_count > 0;
            let out_of_turn = serial.is_some_and(|s| s != header.count_in.wrapping_add(1));
            if !reader_busy && !out_of_turn && self.has_room(record.len()) {
                break;
            }
            if !self.wait(Role::Writer, deadline)? {
                return Ok(None);
            }
        }

        let capacity = self.ring.capacity_words as u64;
        let words_in = self.header().words_in;
        let data = self.data();
        set_word_at(data, words_in, record.len() as u32);
        copy_into(data, ((words_in + 1) % capacity) as usize, record);

        let header = self.header();
        header.words_in += record.len() as u64 + 1;
        header.count_in = header.count_in.wrapping_add(1);
        let count = header.count_in;
        trace!("write #{} ({} words) at {}", count, record.len(), words_in % capacity);
        Ok(Some(count))
    }

    fn read(
        &mut self,
        sink: RecordSink<'_>,
        force: bool,
        deadline: Option<Instant>,
    ) -> ShmResult<Option<ReadInfo>> {
        self.enter(Role::Reader);
        let result = self.read_entered(sink, force, deadline);
        self.leave(Role::Reader);
        result
    }

    fn read_entered(
        &mut self,
        sink: RecordSink<'_>,
        force: bool,
        deadline: Option<Instant>,
    ) -> ShmResult<Option<ReadInfo>> {
        let len = loop {
            let writer_busy = !force && self.header().writer_count > 0;
            if !writer_busy {
                if let Some(len) = self.next_record_len() {
                    break len as usize;
                }
            }
            if !self.wait(Role::Reader, deadline)? {
                return Ok(None);
            }
        };

        let capacity = self.ring.capacity_words as u64;
        let words_out = self.header().words_out;
        let start = ((words_out + 1) % capacity) as usize;
        match sink {
            RecordSink::Slice(buf) => {
                if buf.len() < len {
                    return Err(ShmError::BufferTooSmall {
                        needed: len,
                        available: buf.len(),
                    });
                }
                copy_out(self.data(), start, &mut buf[..len]);
            }
            RecordSink::Vec(out) => {
                out.clear();
                out.resize(len, 0);
                copy_out(self.data(), start, out);
            }
        }

        let header = self.header();
        header.words_out += len as u64 + 1;
        header.count_out = header.count_out.wrapping_add(1);
        let count = header.count_out;
        trace!("read #{} ({} words) at {}", count, len, words_out % capacity);

        // Report ourselves as gone in the snapshot handed back.
        let mut snapshot = header.snapshot();
        snapshot.reader_count = snapshot.reader_count.saturating_sub(1);
        Ok(Some(ReadInfo {
            count,
            words: len,
            header: snapshot,
        }))
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ring.cond().notify_all() {
            tracing::error!("Ring {}: broadcast failed: {}", self.ring.shm.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(tag: &str, capacity: usize) -> SharedEventBuffer {
        let name = format!("evbuf_ringunit_{}_{}", tag, std::process::id());
        SharedEventBuffer::open(&name, capacity, true).unwrap()
    }

    #[test]
    fn test_rejects_tiny_capacity() {
        let name = format!("evbuf_ringunit_tiny_{}", std::process::id());
        assert!(matches!(
            SharedEventBuffer::open(&name, 2, true),
            Err(ShmError::InvalidCapacity { capacity_words: 2 })
        ));
    }

    #[test]
    fn test_rejects_oversized_capacity() {
        let name = format!("evbuf_ringunit_huge_{}", std::process::id());
        for capacity in [MAX_CAPACITY_WORDS + 1, (1 << 62) + 16, usize::MAX / 2, usize::MAX] {
            assert!(matches!(
                SharedEventBuffer::open(&name, capacity, true),
                Err(ShmError::InvalidCapacity { capacity_words }) if capacity_words == capacity
            ));
        }
        // Nothing was created on the way to the error.
        assert!(!SharedEventBuffer::unlink_name(&name).unwrap());
    }

    #[test]
    fn test_record_checks_before_locking() {
        let r = ring("checks", 8);
        assert!(matches!(r.write(&[], false, None), Err(ShmError::EmptyRecord)));
        assert!(matches!(
            r.write(&[0; 7], false, None),
            Err(ShmError::RecordTooLarge { words: 7, max: 6 })
        ));
        assert_eq!(r.header().unwrap().words_in, 0);
        r.unlink().unwrap();
    }

    #[test]
    fn test_largest_record_fits_empty_ring() {
        let r = ring("largest", 8);
        assert!(r.is_writable(6).unwrap());
        assert!(!r.is_writable(7).unwrap());
        r.write(&[1, 2, 3, 4, 5, 6], false, None).unwrap();
        assert_eq!(r.header().unwrap().buffered_words(), 7);
        let (rec, _) = r.read_record(false).unwrap();
        assert_eq!(rec, vec![1, 2, 3, 4, 5, 6]);
        r.unlink().unwrap();
    }

    #[test]
    fn test_readable_predicate() {
        let r = ring("readable", 16);
        assert!(!r.is_readable(0).unwrap());
        r.write(&[9, 9], false, None).unwrap();
        assert!(r.is_readable(0).unwrap());
        assert!(r.is_readable(2).unwrap());
        assert!(!r.is_readable(3).unwrap());
        r.unlink().unwrap();
    }

    #[test]
    fn test_buffer_too_small_keeps_record() {
        let r = ring("small", 16);
        r.write(&[1, 2, 3], false, None).unwrap();
        let mut buf = [0u32; 2];
        assert!(matches!(
            r.read(&mut buf, false),
            Err(ShmError::BufferTooSmall { needed: 3, available: 2 })
        ));
        let mut buf = [0u32; 4];
        let info = r.read(&mut buf, false).unwrap();
        assert_eq!(info.words, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        let header = r.header().unwrap();
        assert_eq!((header.reader_count, header.writer_count), (0, 0));
        r.unlink().unwrap();
    }

    #[test]
    fn test_timeouts_leave_state_untouched() {
        let r = ring("timeouts", 8);
        assert_eq!(
            r.read_timeout(&mut [0u32; 4], false, Duration::from_millis(20)).unwrap(),
            None
        );
        r.write(&[1, 2, 3, 4, 5], false, None).unwrap();
        assert_eq!(
            r.write_timeout(&[1], false, None, Duration::from_millis(20)).unwrap(),
            None
        );
        let header = r.header().unwrap();
        assert_eq!(header.count_in, 1);
        assert_eq!(header.words_in, 6);
        assert_eq!((header.reader_count, header.writer_count), (0, 0));
        r.unlink().unwrap();
    }

    #[test]
    fn test_guard_batches_without_blocking() {
        let r = ring("guard", 16);
        {
            let mut guard = r.lock().unwrap();
            assert_eq!(guard.try_write(&[1, 2], None).unwrap(), Some(1));
            assert_eq!(guard.try_write(&[3], None).unwrap(), Some(2));
            assert_eq!(guard.try_write(&[0; 12], None).unwrap(), None);
            guard.set_run(RunInfo {
                exp_number: 1,
                run_number: 2,
                subrun_number: 3,
            });
            let (rec, info) = guard.try_read_record().unwrap().unwrap();
            assert_eq!(rec, vec![1, 2]);
            assert_eq!(info.count, 1);
        }
        let header = r.header().unwrap();
        assert_eq!(header.run.run_number, 2);
        assert_eq!(header.pending_records(), 1);
        r.unlink().unwrap();
    }

    #[test]
    fn test_clear_keeps_ring_usable() {
        let r = ring("clear", 16);
        r.write(&[7, 7, 7], false, None).unwrap();
        r.set_run(RunInfo {
            exp_number: 3,
            run_number: 4,
            subrun_number: 0,
        })
        .unwrap();
        r.clear().unwrap();
        let header = r.header().unwrap();
        assert!(header.is_empty());
        assert_eq!(header.count_in, 0);
        assert_eq!(header.run, RunInfo::default());
        assert_eq!(header.capacity_words, 16);

        let other = SharedEventBuffer::open(r.name(), 16, false).unwrap();
        assert_eq!(other.write(&[1], false, None).unwrap(), 1);
        r.unlink().unwrap();
    }

    #[test]
    fn test_attach_with_wrong_capacity() {
        let r = ring("capmismatch", 16);
        let other = SharedEventBuffer::open(r.name(), 32, false);
        assert!(matches!(
            other,
            Err(ShmError::CapacityMismatch {
                expected: 32,
                found: 16,
                ..
            })
        ));
        r.unlink().unwrap();
    }

    #[test]
    fn test_attach_before_init_times_out() {
        let name = format!("evbuf_ringunit_uninit_{}", std::process::id());
        // A bare segment of the right size with no header magic.
        let _raw = SharedMemory::open(&name, segment_size(16).unwrap(), true).unwrap();
        let result = SharedEventBuffer::open_with(
            &name,
            16,
            BufferOptions {
                attach_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ShmError::NotInitialized { .. })));
        SharedMemory::unlink_name(&name).unwrap();
    }
}
