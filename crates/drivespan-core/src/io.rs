use sha1::{Digest, Sha1};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Minimum spacing between progress callbacks.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Tee-writer over a destination sink: every successful write also feeds a
/// streaming SHA-1 and a byte counter, and the progress callback fires with
/// the bytes accumulated since the previous point, at most once per second.
pub struct HashingWriter<W: Write, F: FnMut(u64)> {
    inner: W,
    sha1: Sha1,
    bytes_written: u64,
    reported: u64,
    started: Instant,
    last_point: Instant,
    on_progress: F,
}

impl<W: Write, F: FnMut(u64)> HashingWriter<W, F> {
    pub fn new(inner: W, on_progress: F) -> Self {
        let now = Instant::now();
        HashingWriter {
            inner,
            sha1: Sha1::new(),
            bytes_written: 0,
            reported: 0,
            started: now,
            last_point: now,
            on_progress,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_per_second(&self) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_written as f64 / elapsed) as u64
        } else {
            self.bytes_written
        }
    }

    /// Emits any unreported bytes as a progress point.
    pub fn flush_progress(&mut self) {
        let delta = self.bytes_written - self.reported;
        if delta > 0 {
            (self.on_progress)(delta);
            self.reported = self.bytes_written;
        }
        self.last_point = Instant::now();
    }

    /// Flushes the final progress point, closes the sink, and returns the
    /// hex digest with the total byte count.
    pub fn finish(mut self) -> (String, u64) {
        self.flush_progress();
        (hex::encode(self.sha1.finalize()), self.bytes_written)
    }
}

impl<W: Write, F: FnMut(u64)> Write for HashingWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.sha1.update(&buf[..n]);
        self.bytes_written += n as u64;
        if self.last_point.elapsed() >= PROGRESS_INTERVAL {
            self.flush_progress();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming SHA-1 of a whole file, hex encoded.
pub fn sha1_of_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches_one_shot_sha1() {
        let mut sink = Vec::new();
        let mut writer = HashingWriter::new(&mut sink, |_| {});
        writer.write_all(b"message ").unwrap();
        writer.write_all(b"digest").unwrap();
        let (digest, bytes) = writer.finish();

        assert_eq!(bytes, 14);
        assert_eq!(digest, hex::encode(Sha1::digest(b"message digest")));
        assert_eq!(sink, b"message digest");
    }

    #[test]
    fn test_known_vector() {
        let mut writer = HashingWriter::new(Vec::new(), |_| {});
        writer.write_all(b"abc").unwrap();
        let (digest, _) = writer.finish();
        assert_eq!(digest, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_finish_reports_remaining_bytes() {
        let mut deltas = Vec::new();
        let writer_deltas = &mut deltas;
        let mut writer = HashingWriter::new(Vec::new(), |d| writer_deltas.push(d));
        writer.write_all(&[0u8; 1000]).unwrap();
        let (_, bytes) = writer.finish();

        assert_eq!(bytes, 1000);
        assert_eq!(deltas.iter().sum::<u64>(), 1000);
    }

    #[test]
    fn test_sha1_of_file_matches_streamed_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob.bin");
        fs::write(&path, b"some file content").unwrap();
        assert_eq!(
            sha1_of_file(&path).unwrap(),
            hex::encode(Sha1::digest(b"some file content"))
        );
    }
}
