use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::time::Instant;

/// Buffer depth for every progress channel. Sends never block: when a
/// consumer falls behind, the newest point is dropped instead.
pub const CHANNEL_BUFFER: usize = 64;

/// Cumulative progress across the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverallProgress {
    pub size_writn: u64,
    pub bytes_per_second: u64,
}

/// Per-file progress scoped to one device.
#[derive(Debug, Clone)]
pub struct FileProgress {
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub fragment_size: u64,
    /// Bytes written so far in the current fragment.
    pub fragment_size_writn: u64,
    /// Cumulative bytes of the source file covered, fragment start included.
    pub file_total_size_writn: u64,
    /// Bytes added on this device since the previous point.
    pub device_size_writn: u64,
    pub device_bytes_per_second: u64,
}

/// Operator-facing mount events emitted while a gate is held closed.
#[derive(Debug, Clone)]
pub enum MountPrompt {
    Waiting { device: usize, message: String },
    Ready { device: usize },
}

/// Consumer side of the progress fan-out. Channel disconnect is terminal.
pub struct ProgressStream {
    pub overall: Receiver<OverallProgress>,
    pub devices: Vec<Receiver<FileProgress>>,
    pub prompts: Receiver<MountPrompt>,
}

/// Producer handle held by one device worker.
pub(crate) struct ProgressSender {
    overall: SyncSender<OverallProgress>,
    device: SyncSender<FileProgress>,
    total_written: Arc<AtomicU64>,
    started: Instant,
}

impl ProgressSender {
    /// Publishes a device-scoped point and folds `delta` into the overall
    /// counters. Both sends drop on a full buffer.
    pub fn report(&self, delta: u64, point: FileProgress) {
        let _ = self.device.try_send(point);

        let total = self.total_written.fetch_add(delta, Ordering::Relaxed) + delta;
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 {
            (total as f64 / elapsed) as u64
        } else {
            total
        };
        let _ = self.overall.try_send(OverallProgress {
            size_writn: total,
            bytes_per_second,
        });
    }
}

/// Builds the progress fan-out: one sender per device plus the prompt
/// sender for the gate keepers, and the consumer stream.
pub(crate) fn channels(
    device_count: usize,
) -> (Vec<ProgressSender>, SyncSender<MountPrompt>, ProgressStream) {
    let started = Instant::now();
    let total_written = Arc::new(AtomicU64::new(0));

    let (overall_tx, overall_rx) = sync_channel(CHANNEL_BUFFER);
    let (prompt_tx, prompt_rx) = sync_channel(CHANNEL_BUFFER);

    let mut senders = Vec::with_capacity(device_count);
    let mut device_rxs = Vec::with_capacity(device_count);
    for _ in 0..device_count {
        let (tx, rx) = sync_channel(CHANNEL_BUFFER);
        senders.push(ProgressSender {
            overall: overall_tx.clone(),
            device: tx,
            total_written: total_written.clone(),
            started,
        });
        device_rxs.push(rx);
    }

    let stream = ProgressStream {
        overall: overall_rx,
        devices: device_rxs,
        prompts: prompt_rx,
    };
    (senders, prompt_tx, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(bytes: u64) -> FileProgress {
        FileProgress {
            file_name: "a.txt".into(),
            file_path: PathBuf::from("/src/a.txt"),
            file_size: 100,
            fragment_size: 100,
            fragment_size_writn: bytes,
            file_total_size_writn: bytes,
            device_size_writn: bytes,
            device_bytes_per_second: 0,
        }
    }

    #[test]
    fn test_overall_accumulates_across_devices() {
        let (senders, _prompts, stream) = channels(2);
        senders[0].report(10, point(10));
        senders[1].report(5, point(5));

        let first = stream.overall.recv().unwrap();
        let second = stream.overall.recv().unwrap();
        assert_eq!(first.size_writn, 10);
        assert_eq!(second.size_writn, 15);
        assert_eq!(stream.devices[0].recv().unwrap().fragment_size_writn, 10);
        assert_eq!(stream.devices[1].recv().unwrap().fragment_size_writn, 5);
    }

    #[test]
    fn test_full_buffer_drops_instead_of_blocking() {
        let (senders, _prompts, stream) = channels(1);
        for i in 0..(CHANNEL_BUFFER as u64 * 2) {
            senders[0].report(1, point(i));
        }
        // Only the buffered points survive; the producer never blocked.
        let received = stream.devices[0].try_iter().count();
        assert_eq!(received, CHANNEL_BUFFER);
    }

    #[test]
    fn test_dropping_senders_disconnects_consumers() {
        let (senders, prompts, stream) = channels(1);
        drop(senders);
        drop(prompts);
        assert!(stream.overall.recv().is_err());
        assert!(stream.prompts.recv().is_err());
    }
}
