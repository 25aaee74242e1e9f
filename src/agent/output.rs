use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

const DRAIN_CHUNK: usize = 8 * 1024;

/// Everything the agent has written to stdout and stderr so far.
///
/// Clones share the same buffer. Reads never consume anything.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    /// The accumulated output, with invalid UTF-8 replaced.
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines containing `needle`, compared case-insensitively.
    pub fn lines_matching(&self, needle: &str) -> Vec<String> {
        let needle = needle.to_lowercase();
        self.contents()
            .lines()
            .filter(|line| line.to_lowercase().contains(&needle))
            .map(str::to_string)
            .collect()
    }
}

/// Copies `reader` into `log` until EOF so the writer never blocks on a full
/// pipe.
pub(crate) fn spawn_drain<R>(mut reader: R, log: OutputLog, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; DRAIN_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => log.append(&buf[..n]),
                Err(err) => {
                    debug!(stream, error = %err, "output drain stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_accumulates_everything() {
        let log = OutputLog::new();
        let input: &'static [u8] = b"level=info msg=\"starting\"\nlevel=error msg=\"boom\"\n";

        spawn_drain(input, log.clone(), "stdout").await.unwrap();

        assert_eq!(log.len(), input.len());
        assert!(log.contents().starts_with("level=info"));
        assert_eq!(log.lines_matching("ERROR"), ["level=error msg=\"boom\""]);
    }

    #[test]
    fn reads_do_not_consume() {
        let log = OutputLog::new();
        log.append(b"one ");
        assert_eq!(log.contents(), "one ");
        log.append(b"two");
        assert_eq!(log.contents(), "one two");
        assert_eq!(log.contents(), "one two");
    }
}
