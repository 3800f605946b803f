//! Bounded capture of a child's output streams.

use std::io::Read;
use std::thread::JoinHandle;

/// The retained head of one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// First `limit` bytes, lossily decoded.
    pub text: String,
    /// Total bytes the stream produced.
    pub total_bytes: u64,
    pub truncated: bool,
}

/// Drain `reader` on a background thread, keeping at most `limit` bytes.
///
/// The stream is always read to EOF so the child never blocks on a full pipe.
pub fn spawn_reader<R>(mut reader: R, limit: usize) -> JoinHandle<CapturedOutput>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut kept = Vec::with_capacity(limit.min(64 * 1024));
        let mut total: u64 = 0;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n as u64;
                    let room = limit.saturating_sub(kept.len());
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("output reader stopped: {e}");
                    break;
                }
            }
        }
        CapturedOutput {
            text: String::from_utf8_lossy(&kept).into_owned(),
            total_bytes: total,
            truncated: total > kept.len() as u64,
        }
    })
}

/// Join a reader thread; a panicked reader yields empty output.
pub fn join_reader(handle: Option<JoinHandle<CapturedOutput>>) -> CapturedOutput {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
