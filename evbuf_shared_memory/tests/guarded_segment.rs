//! Semaphore-guarded segment tests

use evbuf_shared_memory::{SemaphoreSegment, ShmError, ShmResult};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

fn name(tag: &str) -> String {
    format!("evbuf_guarded_{}_{}", tag, std::process::id())
}

#[test]
fn test_create_attach_and_share_bytes() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let creator = SemaphoreSegment::create(&name("share"), 4096, dir.path())?;
    assert!(creator.id_file().exists());
    assert!(creator.creator_alive());

    creator.write_at(128, b"histogram")?;

    let other = SemaphoreSegment::attach(&name("share"), dir.path())?;
    assert_eq!(other.ids(), creator.ids());
    assert_eq!(other.read_at(128, 9)?, b"histogram");

    drop(other);
    creator.destroy()?;
    Ok(())
}

#[test]
fn test_lock_state_is_visible() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let seg = SemaphoreSegment::create(&name("lock"), 1024, dir.path())?;

    assert!(!seg.is_locked()?);
    seg.lock()?;
    assert!(seg.is_locked()?);
    seg.unlock()?;
    assert!(!seg.is_locked()?);

    seg.destroy()?;
    Ok(())
}

#[test]
fn test_lock_excludes_other_holders() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let seg = Arc::new(SemaphoreSegment::create(&name("exclude"), 64, dir.path())?);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let seg = Arc::clone(&seg);
            thread::spawn(move || -> ShmResult<()> {
                for _ in 0..250 {
                    seg.with_lock(|bytes| {
                        let value = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                        thread::yield_now();
                        bytes[..4].copy_from_slice(&(value + 1).to_ne_bytes());
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap()?;
    }

    let total = seg.read_at(0, 4)?;
    assert_eq!(u32::from_ne_bytes([total[0], total[1], total[2], total[3]]), 1000);

    Arc::try_unwrap(seg).expect("sole owner").destroy()?;
    Ok(())
}

#[test]
fn test_panic_inside_lock_releases_semaphore() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let seg = SemaphoreSegment::create(&name("unwind"), 64, dir.path())?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        seg.with_lock(|bytes| {
            bytes[0] = 0xAA;
            panic!("histogram filler failed");
        })
    }));
    assert!(outcome.is_err());
    assert!(!seg.is_locked()?);

    // Another holder gets in and sees the write made before the panic.
    assert_eq!(seg.read_at(0, 1)?, [0xAA]);
    seg.destroy()?;
    Ok(())
}

#[test]
fn test_attach_without_id_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = SemaphoreSegment::attach(&name("missing"), dir.path());
    assert!(matches!(result, Err(ShmError::NotFound { .. })));
}

#[test]
fn test_open_creates_then_attaches() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let first = SemaphoreSegment::open(&name("open"), 256, dir.path())?;
    let second = SemaphoreSegment::open(&name("open"), 256, dir.path())?;
    assert_eq!(first.ids().shm_id, second.ids().shm_id);

    drop(second);
    first.destroy()?;
    assert!(matches!(
        SemaphoreSegment::attach(&name("open"), dir.path()),
        Err(ShmError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn test_out_of_range_access() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let seg = SemaphoreSegment::create(&name("range"), 16, dir.path())?;
    assert!(matches!(
        seg.write_at(10, &[0; 8]),
        Err(ShmError::OutOfBounds { .. })
    ));
    assert!(!seg.is_locked()?);
    seg.destroy()?;
    Ok(())
}
