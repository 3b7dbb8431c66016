use crate::error::{LaunchError, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ATTACH_POLL: Duration = Duration::from_millis(10);

static TUNNEL_SEQ: AtomicU32 = AtomicU32::new(0);

/// Named handshake resource shared with the traced child.
///
/// The parent creates it before forking and passes `name()` to the child
/// through its environment. `wait_for_attach` must only be called once the
/// child has been launched.
pub trait Tunnel: Send {
    fn name(&self) -> &str;

    /// Blocks until the child signals it is ready.
    fn wait_for_attach(&self) -> Result<()>;

    /// Reclaims the backing resource. Safe to call more than once.
    fn release(&mut self);
}

/// Stops a `wait_for_attach` blocked on another thread.
#[derive(Debug, Clone, Default)]
pub struct AttachCancel(Arc<AtomicBool>);

impl AttachCancel {
    pub fn new() -> Self {
        AttachCancel::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// File-backed tunnel. The file starts with a one-line header; the
/// instrumented binary attaches by appending to it.
#[derive(Debug)]
pub struct FileTunnel {
    path: PathBuf,
    name: String,
    header_len: u64,
    attach_timeout: Option<Duration>,
    cancel: AttachCancel,
    released: bool,
}

impl FileTunnel {
    /// Creates the tunnel under `/dev/shm` when available, else the temp dir.
    pub fn create(owner_id: &str, participants: u32, queue_depth: u32) -> io::Result<Self> {
        let shm = Path::new("/dev/shm");
        let dir = if shm.is_dir() { shm.to_path_buf() } else { std::env::temp_dir() };
        Self::create_in(&dir, owner_id, participants, queue_depth)
    }

    pub fn create_in(dir: &Path, owner_id: &str, participants: u32, queue_depth: u32) -> io::Result<Self> {
        let seq = TUNNEL_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("sst_shmem_{}-{}-{}", owner_id, std::process::id(), seq));
        let header = format!("epa-tunnel participants={} queue_depth={}\n", participants, queue_depth);

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(header.as_bytes())?;

        let name = path.to_string_lossy().into_owned();
        debug!(tunnel = %name, participants, queue_depth, "created handshake tunnel");
        Ok(FileTunnel {
            path,
            name,
            header_len: header.len() as u64,
            attach_timeout: None,
            cancel: AttachCancel::new(),
            released: false,
        })
    }

    /// `None` keeps the default of waiting forever.
    pub fn with_attach_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Handle that makes a pending `wait_for_attach` return `AttachCancelled`.
    pub fn attach_cancel(&self) -> AttachCancel {
        self.cancel.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_attached(&self) -> io::Result<bool> {
        Ok(fs::metadata(&self.path)?.len() > self.header_len)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Tunnel for FileTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn wait_for_attach(&self) -> Result<()> {
        if self.is_released() {
            return Err(LaunchError::Tunnel(io::Error::new(
                io::ErrorKind::NotFound,
                "handshake tunnel already released",
            )));
        }
        let start = Instant::now();
        loop {
            if self.is_attached()? {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(LaunchError::AttachCancelled);
            }
            if let Some(limit) = self.attach_timeout {
                if start.elapsed() >= limit {
                    return Err(LaunchError::AttachTimeout(limit));
                }
            }
            std::thread::sleep(ATTACH_POLL);
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(tunnel = %self.name, "released handshake tunnel"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(tunnel = %self.name, error = %e, "failed to remove handshake tunnel"),
        }
    }
}

impl Drop for FileTunnel {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn name_is_the_backing_path() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = FileTunnel::create_in(dir.path(), "core7", 4, 128).unwrap();
        assert_eq!(Path::new(tunnel.name()), tunnel.path());
        assert!(tunnel.name().contains("sst_shmem_core7-"));
        assert!(!tunnel.is_attached().unwrap());
    }

    #[test]
    fn two_tunnels_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileTunnel::create_in(dir.path(), "x", 1, 1).unwrap();
        let b = FileTunnel::create_in(dir.path(), "x", 1, 1).unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn attach_is_seen_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = FileTunnel::create_in(dir.path(), "c", 1, 8).unwrap();
        append(tunnel.path(), b"1");
        assert!(tunnel.is_attached().unwrap());
        tunnel.wait_for_attach().unwrap();
    }

    #[test]
    fn bounded_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = FileTunnel::create_in(dir.path(), "c", 1, 8)
            .unwrap()
            .with_attach_timeout(Some(Duration::from_millis(50)));
        match tunnel.wait_for_attach() {
            Err(LaunchError::AttachTimeout(d)) => assert_eq!(d, Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn cancel_wakes_a_blocked_wait() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = FileTunnel::create_in(dir.path(), "c", 1, 8).unwrap();
        let cancel = tunnel.attach_cancel();
        let waiter = std::thread::spawn(move || tunnel.wait_for_attach());
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(LaunchError::AttachCancelled)));
    }

    #[test]
    fn waiting_on_a_released_tunnel_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut tunnel = FileTunnel::create_in(dir.path(), "c", 1, 8).unwrap();
        tunnel.release();
        match tunnel.wait_for_attach() {
            Err(LaunchError::Tunnel(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected released tunnel error, got {:?}", other),
        }
    }

    #[test]
    fn release_is_idempotent_and_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut tunnel = FileTunnel::create_in(dir.path(), "c", 1, 8).unwrap();
        let path = tunnel.path().to_path_buf();
        tunnel.release();
        assert!(!path.exists());
        assert!(tunnel.is_released());
        tunnel.release();
        drop(tunnel);
        assert!(!path.exists());
    }
}
