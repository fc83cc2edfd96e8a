//! Semaphore-guarded System V segment
//!
//! A flat byte region protected by a single binary semaphore, for monitoring
//! data that is rewritten in place rather than queued. The creator persists
//! the kernel ids in a small JSON file under `id_dir` so that unrelated
//! processes can attach by name later.
//!
//! Semaphore operations use `SEM_UNDO`: if a holder dies the kernel returns
//! the semaphore, so a crash never wedges the segment.

use crate::error::{ShmError, ShmResult};
use crate::platform::{get_current_pid, is_process_alive};
use evbuf::shm::naming::{current_user, sanitize};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, info, warn};

/// Kernel ids persisted in the id-mapping file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIds {
    /// System V shared memory id
    pub shm_id: i32,
    /// System V semaphore set id
    pub sem_id: i32,
    /// Segment size in bytes
    pub size: usize,
    /// Process that created the segment
    pub creator_pid: u32,
}

/// Shared segment guarded by a binary semaphore
#[derive(Debug)]
pub struct SemaphoreSegment {
    name: String,
    ids: SegmentIds,
    id_file: PathBuf,
    addr: NonNull<u8>,
}

// SAFETY: the segment bytes are only handed out under the semaphore.
unsafe impl Send for SemaphoreSegment {}
unsafe impl Sync for SemaphoreSegment {}

impl SemaphoreSegment {
    /// Allocate a fresh segment of `size` bytes and publish its ids.
    ///
    /// An existing id file for `name` is overwritten; the kernel objects it
    /// pointed to are left alone.
    pub fn create(name: &str, size: usize, id_dir: &Path) -> ShmResult<Self> {
        crate::segment::validate_segment_name(name)?;
        crate::segment::validate_segment_size(size)?;

        // SAFETY: plain syscalls; results are checked below.
        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            return Err(last_errno().into());
        }
        let sem_id = unsafe { libc::semget(libc::IPC_PRIVATE, 1, libc::IPC_CREAT | 0o600) };
        if sem_id < 0 {
            let err = last_errno();
            remove_shm(shm_id);
            return Err(err.into());
        }
        // Start unlocked
        if unsafe { libc::semctl(sem_id, 0, libc::SETVAL, 1 as libc::c_int) } < 0 {
            let err = last_errno();
            remove_shm(shm_id);
            remove_sem(sem_id);
            return Err(err.into());
        }

        let addr = match attach_shm(shm_id) {
            Ok(addr) => addr,
            Err(e) => {
                remove_shm(shm_id);
                remove_sem(sem_id);
                return Err(e);
            }
        };

        let ids = SegmentIds {
            shm_id,
            sem_id,
            size,
            creator_pid: get_current_pid(),
        };
        let id_file = id_file_path(id_dir, name);
        if let Err(e) = fs::create_dir_all(id_dir)
            .map_err(ShmError::from)
            .and_then(|()| Ok(serde_json::to_vec_pretty(&ids)?))
            .and_then(|json| Ok(fs::write(&id_file, json)?))
        {
            // A partial write may have left the file behind.
            let _ = fs::remove_file(&id_file);
            detach_shm(addr);
            remove_shm(shm_id);
            remove_sem(sem_id);
            return Err(e);
        }

        info!(
            "Created guarded segment {} (shm {}, sem {}, {} bytes)",
            name, shm_id, sem_id, size
        );
        Ok(Self {
            name: name.to_string(),
            ids,
            id_file,
            addr,
        })
    }

    /// Attach a segment created elsewhere, by reading its id file.
    pub fn attach(name: &str, id_dir: &Path) -> ShmResult<Self> {
        let id_file = id_file_path(id_dir, name);
        let json = match fs::read(&id_file) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let ids: SegmentIds = serde_json::from_slice(&json)?;
        let addr = attach_shm(ids.shm_id).map_err(|e| match e {
            ShmError::Nix {
                source: nix::Error::EINVAL | nix::Error::EIDRM,
            } => ShmError::NotFound {
                name: name.to_string(),
            },
            other => other,
        })?;
        debug!("Attached guarded segment {} (shm {})", name, ids.shm_id);
        Ok(Self {
            name: name.to_string(),
            ids,
            id_file,
            addr,
        })
    }

    /// Create if no id file exists for `name`, otherwise attach.
    pub fn open(name: &str, size: usize, id_dir: &Path) -> ShmResult<Self> {
        match Self::attach(name, id_dir) {
            Err(ShmError::NotFound { .. }) => Self::create(name, size, id_dir),
            other => other,
        }
    }

    /// Block until the semaphore is taken.
    pub fn lock(&self) -> ShmResult<()> {
        self.semop(-1)
    }

    /// Release the semaphore.
    pub fn unlock(&self) -> ShmResult<()> {
        self.semop(1)
    }

    /// Whether some process currently holds the semaphore.
    pub fn is_locked(&self) -> ShmResult<bool> {
        // SAFETY: plain syscall.
        let value = unsafe { libc::semctl(self.ids.sem_id, 0, libc::GETVAL) };
        if value < 0 {
            return Err(last_errno().into());
        }
        Ok(value == 0)
    }

    /// Run `f` on the segment bytes with the semaphore held.
    ///
    /// The semaphore is released even if `f` panics.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> ShmResult<R> {
        self.lock()?;
        let held = HeldSemaphore { segment: self };
        // SAFETY: the semaphore gives this process exclusive use of the bytes.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.ids.size) };
        let result = f(bytes);
        held.release()?;
        Ok(result)
    }

    /// Copy `data` to `offset` under the lock.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> ShmResult<()> {
        self.check_range(offset, data.len())?;
        self.with_lock(|bytes| bytes[offset..offset + data.len()].copy_from_slice(data))
    }

    /// Copy `len` bytes from `offset` under the lock.
    pub fn read_at(&self, offset: usize, len: usize) -> ShmResult<Vec<u8>> {
        self.check_range(offset, len)?;
        self.with_lock(|bytes| bytes[offset..offset + len].to_vec())
    }

    /// Remove the kernel objects and the id file.
    ///
    /// The memory stays mapped in processes that still have it attached
    /// until they detach.
    pub fn destroy(self) -> ShmResult<()> {
        // SAFETY: plain syscalls on ids this handle owns.
        if unsafe { libc::shmctl(self.ids.shm_id, libc::IPC_RMID, std::ptr::null_mut()) } < 0 {
            return Err(last_errno().into());
        }
        if unsafe { libc::semctl(self.ids.sem_id, 0, libc::IPC_RMID) } < 0 {
            return Err(last_errno().into());
        }
        match fs::remove_file(&self.id_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Destroyed guarded segment {}", self.name);
        Ok(())
    }

    /// Whether the creating process is still running.
    pub fn creator_alive(&self) -> bool {
        is_process_alive(self.ids.creator_pid)
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment size in bytes
    pub fn size(&self) -> usize {
        self.ids.size
    }

    /// Persisted kernel ids
    pub fn ids(&self) -> SegmentIds {
        self.ids
    }

    /// Path of the id-mapping file
    pub fn id_file(&self) -> &Path {
        &self.id_file
    }

    fn check_range(&self, offset: usize, len: usize) -> ShmResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.ids.size) {
            return Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.ids.size,
            });
        }
        Ok(())
    }

    fn semop(&self, delta: i16) -> ShmResult<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        loop {
            // SAFETY: op is a valid single-element operation array.
            if unsafe { libc::semop(self.ids.sem_id, &mut op, 1) } == 0 {
                return Ok(());
            }
            match last_errno() {
                nix::Error::EINTR => continue,
                e => return Err(e.into()),
            }
        }
    }
}

impl Drop for SemaphoreSegment {
    fn drop(&mut self) {
        // SAFETY: addr came from shmat and is detached exactly once.
        if unsafe { libc::shmdt(self.addr.as_ptr() as *const libc::c_void) } < 0 {
            warn!("Failed to detach guarded segment {}: {}", self.name, last_errno());
        }
    }
}

/// Semaphore taken by [`SemaphoreSegment::with_lock`]; given back on unwind.
struct HeldSemaphore<'a> {
    segment: &'a SemaphoreSegment,
}

impl HeldSemaphore<'_> {
    fn release(self) -> ShmResult<()> {
        let segment = self.segment;
        std::mem::forget(self);
        segment.unlock()
    }
}

impl Drop for HeldSemaphore<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.segment.unlock() {
            warn!(
                "Failed to release guarded segment {} while unwinding: {}",
                self.segment.name, e
            );
        }
    }
}

/// `<id_dir>/<name>_<user>.ids`
pub fn id_file_path(id_dir: &Path, name: &str) -> PathBuf {
    id_dir.join(format!("{}_{}.ids", sanitize(name), current_user()))
}

fn attach_shm(shm_id: i32) -> ShmResult<NonNull<u8>> {
    // SAFETY: plain syscall; the (void*)-1 error value is checked.
    let addr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(last_errno().into());
    }
    NonNull::new(addr as *mut u8).ok_or(ShmError::Nix {
        source: nix::Error::EFAULT,
    })
}

fn detach_shm(addr: NonNull<u8>) {
    // SAFETY: addr came from shmat and no handle owns it yet.
    unsafe { libc::shmdt(addr.as_ptr() as *const libc::c_void) };
}

fn remove_shm(shm_id: i32) {
    // SAFETY: cleanup of an id created by this process.
    unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
}

fn remove_sem(sem_id: i32) {
    // SAFETY: as above.
    unsafe { libc::semctl(sem_id, 0, libc::IPC_RMID) };
}

fn last_errno() -> nix::Error {
    nix::Error::last()
}
