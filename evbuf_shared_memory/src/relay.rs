//! Pumps between a ring buffer and a stream socket
//!
//! Both directions poll with `poll` as the longest blocking step, so a set
//! `stop` flag is noticed within roughly one interval.

use crate::error::{ShmError, ShmResult};
use crate::ring::SharedEventBuffer;
use crate::stream::StreamSocket;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Counters reported when a relay stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Records moved
    pub records: u64,
    /// Payload words moved
    pub words: u64,
}

impl RelayStats {
    fn add(&mut self, words: usize) {
        self.records += 1;
        self.words += words as u64;
    }
}

/// Read records from `ring` and send each as one frame until `stop` is set.
pub fn drain_to_stream(
    ring: &SharedEventBuffer,
    socket: &mut StreamSocket,
    stop: &AtomicBool,
    poll: Duration,
) -> ShmResult<RelayStats> {
    info!("Relaying ring {} to {}", ring.name(), socket.peer_addr());
    let mut stats = RelayStats::default();
    while !stop.load(Ordering::Relaxed) {
        if let Some((record, info)) = ring.read_record_timeout(false, poll)? {
            socket.put_words(&record)?;
            stats.add(record.len());
            tracing::trace!("Relayed record #{} ({} words)", info.count, record.len());
        }
    }
    info!(
        "Ring {} relay stopped: {} records, {} words",
        ring.name(),
        stats.records,
        stats.words
    );
    Ok(stats)
}

/// Receive frames from `socket` and write them into `ring`.
///
/// Ends when `stop` is set or the peer closes the connection.
pub fn fill_from_stream(
    socket: &mut StreamSocket,
    ring: &SharedEventBuffer,
    stop: &AtomicBool,
    poll: Duration,
) -> ShmResult<RelayStats> {
    info!("Relaying {} into ring {}", socket.peer_addr(), ring.name());
    socket.set_read_timeout(Some(poll))?;
    let mut stats = RelayStats::default();
    'frames: while !stop.load(Ordering::Relaxed) {
        let record = match socket.try_get_words() {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(ShmError::ConnectionClosed) => {
                debug!("Peer {} closed the stream", socket.peer_addr());
                break;
            }
            Err(e) => return Err(e),
        };
        if record.is_empty() {
            continue;
        }
        while ring.write_timeout(&record, false, None, poll)?.is_none() {
            if stop.load(Ordering::Relaxed) {
                break 'frames;
            }
        }
        stats.add(record.len());
    }
    info!(
        "Stream relay into {} stopped: {} records, {} words",
        ring.name(),
        stats.records,
        stats.words
    );
    Ok(stats)
}
