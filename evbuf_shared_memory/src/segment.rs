//! Named POSIX shared-memory segments

use crate::error::{ShmError, ShmResult};
use crate::platform::shm_object_path;
use evbuf::shm::consts::{CACHE_LINE_SIZE, SHM_MAX_SIZE};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::ptr::NonNull;
use tracing::{debug, info};

/// Handle on a named, fixed-size shared-memory object.
///
/// The OS object outlives every handle: [`close`](Self::close) only unmaps
/// it from this process, [`unlink`](Self::unlink) removes the name.
pub struct SharedMemory {
    /// Segment name without the leading `/`
    name: String,
    /// Object size in bytes
    size: usize,
    /// This handle created the OS object
    created: bool,
    file: Option<File>,
    mmap: Option<MmapMut>,
}

impl SharedMemory {
    /// Create or attach the object `name` with `size` bytes.
    ///
    /// With `recreate` any existing object of that name is unlinked first, so
    /// the caller always gets a fresh zero-filled object. Without it an
    /// existing object is attached as-is and must have exactly `size` bytes.
    pub fn open(name: &str, size: usize, recreate: bool) -> ShmResult<Self> {
        validate_segment_name(name)?;
        validate_segment_size(size)?;

        let os_name = os_name(name);
        if recreate && Self::unlink_name(name)? {
            debug!("Unlinked previous segment {}", name);
        }

        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let (fd, created) = match shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            mode,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => (shm_open(os_name.as_str(), OFlag::O_RDWR, mode)?, false),
            Err(e) => return Err(e.into()),
        };

        let file = File::from(fd);
        let found = file.metadata()?.len() as usize;
        if created || found == 0 {
            // A racing creator may not have sized the object yet
            file.set_len(size as u64)?;
        } else if found != size {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: size,
                found,
            });
        }

        if created {
            info!("Created segment {} ({} bytes)", name, size);
        } else {
            debug!("Attached segment {} ({} bytes)", name, size);
        }

        Ok(Self {
            name: name.to_string(),
            size,
            created,
            file: Some(file),
            mmap: None,
        })
    }

    /// Map the object (once) and return a pointer to `offset`.
    ///
    /// The pointer stays valid until [`close`](Self::close) or drop.
    pub fn map(&mut self, offset: usize, len: usize) -> ShmResult<NonNull<u8>> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size);
        if !in_bounds {
            return Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }

        if self.mmap.is_none() {
            let file = self.file.as_ref().ok_or_else(|| ShmError::NotMapped {
                name: self.name.clone(),
            })?;
            // SAFETY: the object is sized to `self.size` in `open`; concurrent
            // modification by other processes is coordinated by the callers.
            let mmap = unsafe { MmapOptions::new().len(self.size).map_mut(file)? };
            validate_memory_alignment(mmap.as_ptr() as usize)?;
            self.mmap = Some(mmap);
        }

        let mmap = self.mmap.as_mut().ok_or_else(|| ShmError::NotMapped {
            name: self.name.clone(),
        })?;
        // SAFETY: offset is within the mapping, checked above.
        let ptr = unsafe { mmap.as_mut_ptr().add(offset) };
        NonNull::new(ptr).ok_or_else(|| ShmError::NotMapped {
            name: self.name.clone(),
        })
    }

    /// Unmap from this process. The OS object persists.
    pub fn close(&mut self) {
        if self.mmap.take().is_some() || self.file.is_some() {
            debug!("Closed segment {}", self.name);
        }
        self.file = None;
    }

    /// Remove the OS-level name. Other processes keep their mappings; the
    /// next `open` of this name creates a new object.
    pub fn unlink(&self) -> ShmResult<bool> {
        Self::unlink_name(&self.name)
    }

    /// Remove the OS-level name `name`. Returns `false` if it did not exist.
    pub fn unlink_name(name: &str) -> ShmResult<bool> {
        validate_segment_name(name)?;
        match shm_unlink(os_name(name).as_str()) {
            Ok(()) => {
                info!("Unlinked segment {}", name);
                Ok(true)
            }
            Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether an object named `name` currently exists.
    pub fn exists(name: &str) -> bool {
        shm_object_path(name).exists()
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the OS object
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Whether the object is currently mapped into this process
    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }
}

fn os_name(name: &str) -> String {
    format!("/{name}")
}

/// Validate an shm object name (no leading slash, no embedded slash or NUL)
pub fn validate_segment_name(name: &str) -> ShmResult<()> {
    if name.is_empty() || name.len() > 255 || name.contains('/') || name.contains('\0') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate segment size constraints
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if size == 0 || size > SHM_MAX_SIZE {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// Validate memory alignment
pub fn validate_memory_alignment(address: usize) -> ShmResult<()> {
    if address % CACHE_LINE_SIZE != 0 {
        return Err(ShmError::AlignmentError {
            address,
            alignment: CACHE_LINE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("evbuf_segtest_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_segment_size_validation() {
        assert!(validate_segment_size(1).is_ok());
        assert!(validate_segment_size(4096).is_ok());
        assert!(validate_segment_size(0).is_err());
        assert!(validate_segment_size(SHM_MAX_SIZE + 1).is_err());
    }

    #[test]
    fn test_segment_name_validation() {
        assert!(validate_segment_name("evbuf_user_node").is_ok());
        assert!(validate_segment_name("").is_err());
        assert!(validate_segment_name("/leading").is_err());
        assert!(validate_segment_name("a/b").is_err());
    }

    #[test]
    fn test_create_then_attach_shares_bytes() {
        let name = unique("share");
        let mut creator = SharedMemory::open(&name, 4096, true).unwrap();
        assert!(creator.is_created());
        let p = creator.map(100, 4).unwrap();
        unsafe { p.as_ptr().write(0x5A) };

        let mut other = SharedMemory::open(&name, 4096, false).unwrap();
        assert!(!other.is_created());
        let q = other.map(100, 4).unwrap();
        assert_eq!(unsafe { q.as_ptr().read() }, 0x5A);

        creator.unlink().unwrap();
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let name = unique("mismatch");
        let _creator = SharedMemory::open(&name, 4096, true).unwrap();
        let other = SharedMemory::open(&name, 8192, false);
        assert!(matches!(other, Err(ShmError::SizeMismatch { .. })));
        SharedMemory::unlink_name(&name).unwrap();
    }

    #[test]
    fn test_map_bounds_and_close() {
        let name = unique("bounds");
        let mut shm = SharedMemory::open(&name, 4096, true).unwrap();
        assert!(matches!(
            shm.map(4000, 200),
            Err(ShmError::OutOfBounds { .. })
        ));
        assert!(shm.map(0, 4096).is_ok());
        assert!(shm.is_mapped());

        shm.close();
        assert!(!shm.is_mapped());
        assert!(matches!(shm.map(0, 16), Err(ShmError::NotMapped { .. })));

        // The object outlives the handle
        assert!(SharedMemory::exists(&name));
        assert!(SharedMemory::unlink_name(&name).unwrap());
        assert!(!SharedMemory::exists(&name));
        assert!(!SharedMemory::unlink_name(&name).unwrap());
    }

    #[test]
    fn test_recreate_zeroes_contents() {
        let name = unique("recreate");
        {
            let mut shm = SharedMemory::open(&name, 4096, true).unwrap();
            let p = shm.map(0, 1).unwrap();
            unsafe { p.as_ptr().write(7) };
        }
        let mut shm = SharedMemory::open(&name, 4096, true).unwrap();
        assert!(shm.is_created());
        let p = shm.map(0, 1).unwrap();
        assert_eq!(unsafe { p.as_ptr().read() }, 0);
        shm.unlink().unwrap();
    }
}
