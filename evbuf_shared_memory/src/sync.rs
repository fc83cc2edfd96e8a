//! Process-shared mutex and condition variable stored inside a segment
//!
//! Both primitives are plain `pthread` objects placed at fixed offsets of a
//! shared mapping. Exactly one process (the segment creator) calls `init`;
//! every other process only reinterprets the existing bytes.

use crate::error::{ShmError, ShmResult};
use libc::{pthread_cond_t, pthread_condattr_t, pthread_mutex_t, pthread_mutexattr_t};
use nix::time::{ClockId, clock_gettime};
use nix::sys::time::TimeSpec;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::Duration;

/// How a lock was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Normal acquisition
    Acquired,
    /// Previous owner died holding the lock; state it guarded may be stale
    OwnerDied,
}

/// Mutex shared between processes through the memory it lives in
#[repr(C)]
pub struct ProcessMutex {
    raw: UnsafeCell<pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed for concurrent use; PTHREAD_PROCESS_SHARED
// extends that across processes.
unsafe impl Sync for ProcessMutex {}
unsafe impl Send for ProcessMutex {}

impl ProcessMutex {
    /// Reinterpret `ptr` as a mutex.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size_of::<pthread_mutex_t>()` bytes, suitably
    /// aligned, and outlive `'a`.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a Self {
        unsafe { &*(ptr as *const Self) }
    }

    /// Initialise the mutex as process-shared (and robust if asked).
    ///
    /// Must run exactly once per segment, before any other process attaches.
    pub fn init(&self, robust: bool) -> ShmResult<()> {
        let mut attr = MaybeUninit::<pthread_mutexattr_t>::uninit();
        // SAFETY: attr is initialised by pthread_mutexattr_init before use and
        // destroyed before return; self.raw points into the mapped segment.
        unsafe {
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let result = (|| {
                check(
                    "pthread_mutexattr_setpshared",
                    libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
                )?;
                if robust {
                    check(
                        "pthread_mutexattr_setrobust",
                        libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST),
                    )?;
                }
                check("pthread_mutex_init", libc::pthread_mutex_init(self.raw.get(), attr.as_ptr()))
            })();
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result
        }
    }

    /// Block until the mutex is held.
    ///
    /// Interrupted calls are retried. If the previous owner died the mutex is
    /// made consistent again and `LockState::OwnerDied` is reported.
    pub fn lock(&self) -> ShmResult<(MutexGuard<'_>, LockState)> {
        loop {
            // SAFETY: raw points to an initialised process-shared mutex.
            let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
            match rc {
                0 => return Ok((MutexGuard { mutex: self }, LockState::Acquired)),
                libc::EINTR => continue,
                libc::EOWNERDEAD => {
                    self.make_consistent()?;
                    return Ok((MutexGuard { mutex: self }, LockState::OwnerDied));
                }
                code => return Err(ShmError::sync("pthread_mutex_lock", code)),
            }
        }
    }

    fn make_consistent(&self) -> ShmResult<()> {
        tracing::warn!("Previous mutex owner died; recovering shared state");
        // SAFETY: called while holding a robust mutex returned with EOWNERDEAD.
        check("pthread_mutex_consistent", unsafe {
            libc::pthread_mutex_consistent(self.raw.get())
        })
    }

    fn unlock_raw(&self) -> ShmResult<()> {
        loop {
            // SAFETY: only called by the guard that holds the lock.
            let rc = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
            match rc {
                0 => return Ok(()),
                libc::EINTR => continue,
                code => return Err(ShmError::sync("pthread_mutex_unlock", code)),
            }
        }
    }
}

/// Held lock on a [`ProcessMutex`]; unlocks on drop
pub struct MutexGuard<'a> {
    mutex: &'a ProcessMutex,
}

impl MutexGuard<'_> {
    /// Unlock explicitly, observing any error.
    pub fn unlock(self) -> ShmResult<()> {
        let mutex = self.mutex;
        std::mem::forget(self);
        mutex.unlock_raw()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock_raw() {
            tracing::error!("Failed to release shared mutex: {}", e);
        }
    }
}

/// Condition variable shared between processes through the memory it lives in
#[repr(C)]
pub struct ProcessCond {
    raw: UnsafeCell<pthread_cond_t>,
}

// SAFETY: see ProcessMutex.
unsafe impl Sync for ProcessCond {}
unsafe impl Send for ProcessCond {}

impl ProcessCond {
    /// Reinterpret `ptr` as a condition variable.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size_of::<pthread_cond_t>()` bytes, suitably
    /// aligned, and outlive `'a`.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a Self {
        unsafe { &*(ptr as *const Self) }
    }

    /// Initialise as process-shared, timing out against `CLOCK_MONOTONIC`.
    ///
    /// Must run exactly once per segment, before any other process attaches.
    pub fn init(&self) -> ShmResult<()> {
        let mut attr = MaybeUninit::<pthread_condattr_t>::uninit();
        // SAFETY: as in ProcessMutex::init.
        unsafe {
            check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            let result = (|| {
                check(
                    "pthread_condattr_setpshared",
                    libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
                )?;
                check(
                    "pthread_condattr_setclock",
                    libc::pthread_condattr_setclock(attr.as_mut_ptr(), libc::CLOCK_MONOTONIC),
                )?;
                check("pthread_cond_init", libc::pthread_cond_init(self.raw.get(), attr.as_ptr()))
            })();
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            result
        }
    }

    /// Release `guard`'s mutex, wait for a notification, re-acquire.
    pub fn wait(&self, guard: &mut MutexGuard<'_>) -> ShmResult<LockState> {
        // SAFETY: guard proves the calling thread holds the mutex.
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) };
        match rc {
            0 | libc::EINTR => Ok(LockState::Acquired),
            libc::EOWNERDEAD => {
                guard.mutex.make_consistent()?;
                Ok(LockState::OwnerDied)
            }
            code => Err(ShmError::sync("pthread_cond_wait", code)),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// A timeout is not an error: the mutex is held again on return and the
    /// caller re-checks its predicate against its own deadline.
    pub fn wait_timeout(
        &self,
        guard: &mut MutexGuard<'_>,
        timeout: Duration,
    ) -> ShmResult<LockState> {
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
        let deadline = now + TimeSpec::from_duration(timeout);
        // SAFETY: guard proves the calling thread holds the mutex.
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), deadline.as_ref())
        };
        match rc {
            0 | libc::EINTR | libc::ETIMEDOUT => Ok(LockState::Acquired),
            libc::EOWNERDEAD => {
                guard.mutex.make_consistent()?;
                Ok(LockState::OwnerDied)
            }
            code => Err(ShmError::sync("pthread_cond_timedwait", code)),
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) -> ShmResult<()> {
        // SAFETY: raw points to an initialised process-shared condvar.
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.raw.get())
        })
    }
}

fn check(op: &'static str, rc: libc::c_int) -> ShmResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::sync(op, rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SharedMemory;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct Pair {
        shm: SharedMemory,
        base: usize,
    }

    impl Pair {
        fn mutex(&self) -> &ProcessMutex {
            unsafe { ProcessMutex::from_ptr(self.base as *mut u8) }
        }
        fn cond(&self) -> &ProcessCond {
            unsafe { ProcessCond::from_ptr((self.base + 64) as *mut u8) }
        }
    }

    fn pair(tag: &str) -> Pair {
        let name = format!("evbuf_synctest_{}_{}", tag, std::process::id());
        let mut shm = SharedMemory::open(&name, 4096, true).unwrap();
        let base = shm.map(0, 4096).unwrap().as_ptr() as usize;
        let pair = Pair { shm, base };
        pair.mutex().init(true).unwrap();
        pair.cond().init().unwrap();
        pair
    }

    #[test]
    fn test_lock_and_unlock() {
        let p = pair("lock");
        let (guard, state) = p.mutex().lock().unwrap();
        assert_eq!(state, LockState::Acquired);
        guard.unlock().unwrap();
        let (_guard, _) = p.mutex().lock().unwrap();
        p.shm.unlink().unwrap();
    }

    #[test]
    fn test_timed_wait_expires() {
        let p = pair("timeout");
        let (mut guard, _) = p.mutex().lock().unwrap();
        let start = Instant::now();
        let state = p
            .cond()
            .wait_timeout(&mut guard, Duration::from_millis(50))
            .unwrap();
        assert_eq!(state, LockState::Acquired);
        assert!(start.elapsed() >= Duration::from_millis(40));
        drop(guard);
        p.shm.unlink().unwrap();
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let p = Arc::new(pair("notify"));
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let p = Arc::clone(&p);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                let (mut guard, _) = p.mutex().lock().unwrap();
                while !flag.load(Ordering::SeqCst) {
                    p.cond().wait(&mut guard).unwrap();
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        {
            let (_guard, _) = p.mutex().lock().unwrap();
            flag.store(true, Ordering::SeqCst);
            p.cond().notify_all().unwrap();
        }
        waiter.join().unwrap();
        p.shm.unlink().unwrap();
    }
}
