//! Waiting for files another process writes.
//!
//! The node communicates several milestones only through the filesystem: the
//! auth cookie appears once the control listener is up, and a hidden
//! service's `hostname` file appears once the service directory has been
//! provisioned. [`WriteObserver`] is the single primitive every such wait
//! goes through, so embedders can swap in OS notification mechanisms where
//! they have them.

use crate::error::{Result, TorError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Interval between fingerprint checks of the polling implementation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Blocks until a designated file is observed to change.
#[async_trait]
pub trait WriteObserver: Send {
    /// Wait up to `timeout` for the watched file's content to differ from
    /// what it was when the observer was constructed. Returns `true` if a
    /// change was seen, `false` if the timeout elapsed first.
    async fn poll(&mut self, timeout: Duration) -> Result<bool>;
}

/// Builds an observer for a file. [`NodeConfig`](crate::config::NodeConfig)
/// carries one of these so platform watchers can replace the default.
pub type ObserverFactory =
    Arc<dyn Fn(&Path) -> Result<Box<dyn WriteObserver>> + Send + Sync + 'static>;

/// Returns the portable polling factory.
pub fn polling_observer_factory() -> ObserverFactory {
    Arc::new(|path| Ok(Box::new(HashPollObserver::new(path)?) as Box<dyn WriteObserver>))
}

/// Content fingerprint: length plus SHA-256 digest. Unrelated activity in
/// the same directory never changes it.
#[derive(PartialEq, Eq, Clone)]
struct Fingerprint {
    len: u64,
    digest: [u8; 32],
}

fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(Fingerprint {
        len: content.len() as u64,
        digest: hasher.finalize().into(),
    })
}

/// The always-correct default: snapshot a content fingerprint at
/// construction, re-check on a short interval until it changes.
pub struct HashPollObserver {
    path: PathBuf,
    baseline: Fingerprint,
}

impl HashPollObserver {
    /// Snapshot the file. The file must already exist; callers create empty
    /// placeholder files before handing them to the writing process.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let baseline = fingerprint(&path).map_err(|e| {
            TorError::Config(format!("cannot watch {}: {e}", path.display()))
        })?;
        Ok(HashPollObserver { path, baseline })
    }
}

#[async_trait]
impl WriteObserver for HashPollObserver {
    async fn poll(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            // A read can fail transiently while the writer replaces the
            // file; treat that round as "no change yet".
            if let Ok(current) = fingerprint(&self.path) {
                if current != self.baseline {
                    trace!(path = %self.path.display(), "watched file changed");
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn detects_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cookie");
        fs::write(&file, b"").unwrap();

        let mut observer = HashPollObserver::new(&file).unwrap();
        let writer = {
            let file = file.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                fs::write(&file, b"secret").unwrap();
            })
        };

        assert!(observer.poll(Duration::from_secs(2)).await.unwrap());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn times_out_without_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hostname");
        fs::write(&file, b"stable").unwrap();

        let mut observer = HashPollObserver::new(&file).unwrap();
        assert!(!observer.poll(Duration::from_millis(200)).await.unwrap());
    }

    #[tokio::test]
    async fn ignores_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("watched");
        fs::write(&watched, b"fixed").unwrap();

        let mut observer = HashPollObserver::new(&watched).unwrap();
        fs::write(dir.path().join("noise"), b"unrelated").unwrap();
        assert!(!observer.poll(Duration::from_millis(200)).await.unwrap());
    }

    #[test]
    fn requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HashPollObserver::new(dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn same_length_different_bytes_is_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"aaaa").unwrap();

        let mut observer = HashPollObserver::new(&file).unwrap();
        fs::write(&file, b"bbbb").unwrap();
        assert!(observer.poll(Duration::from_millis(500)).await.unwrap());
    }
}
