//! Segment discovery by scanning the shm filesystem

use crate::error::ShmResult;
use crate::header::capacity_for_size;
use evbuf::shm::consts::SHM_DIR;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;

/// Segment metadata information
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Segment name
    pub name: String,
    /// Object size in bytes
    pub size: usize,
    /// Ring capacity implied by the size, if it is a ring-sized object
    pub capacity_words: Option<usize>,
    /// Owning user id
    pub owner_uid: u32,
    /// Last modification timestamp
    pub modified: SystemTime,
}

/// List segments whose name starts with `prefix`, sorted by name.
pub fn list_segments(prefix: &str) -> ShmResult<Vec<SegmentInfo>> {
    list_segments_in(Path::new(SHM_DIR), prefix)
}

/// Find one segment by exact name.
pub fn find_segment(name: &str) -> ShmResult<Option<SegmentInfo>> {
    Ok(list_segments(name)?.into_iter().find(|s| s.name == name))
}

/// [`list_segments`] against an arbitrary directory.
pub fn list_segments_in(dir: &Path, prefix: &str) -> ShmResult<Vec<SegmentInfo>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)?.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        // Entries can vanish between readdir and stat
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let size = meta.len() as usize;
        segments.push(SegmentInfo {
            name,
            size,
            capacity_words: capacity_for_size(size),
            owner_uid: meta.uid(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    segments.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::segment_size;

    #[test]
    fn test_filters_by_prefix_and_derives_capacity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("evbuf_a"), vec![0u8; segment_size(16).unwrap()]).unwrap();
        std::fs::write(dir.path().join("evbuf_b"), vec![0u8; 3]).unwrap();
        std::fs::write(dir.path().join("other"), vec![0u8; 8]).unwrap();
        std::fs::create_dir(dir.path().join("evbuf_dir")).unwrap();

        let found = list_segments_in(dir.path(), "evbuf_").unwrap();
        let names: Vec<_> = found.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["evbuf_a", "evbuf_b"]);
        assert_eq!(found[0].capacity_words, Some(16));
        assert_eq!(found[1].capacity_words, None);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let found = list_segments_in(Path::new("/nonexistent/evbuf"), "").unwrap();
        assert!(found.is_empty());
    }
}
