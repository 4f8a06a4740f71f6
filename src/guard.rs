// boltd - Thunderbolt/USB4 device authorization daemon
//
// Reference-counted "keep the controller powered" tickets, backed by a
// state file and an optional named FIFO used for crash-safe client
// liveness tracking. See spec.md §4.6.

use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use crate::error::Result;
use crate::keyfile::KeyFile;

/// One outstanding request to keep force-power asserted.
pub struct Guard {
    pub id: String,
    pub who: String,
    pub pid: i32,
    statefile: Option<PathBuf>,
    fifopath: Option<PathBuf>,
}

fn state_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.guard"))
}

fn fifo_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.guard.fifo"))
}

impl Guard {
    /// Creates a new guard and persists its state file under `dir`.
    pub fn create(dir: &Path, who: impl Into<String>, pid: i32) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let who = who.into();

        fs::create_dir_all(dir)?;

        let mut kf = KeyFile::new();
        kf.set("guard", "id", &id);
        kf.set("guard", "who", &who);
        kf.set("guard", "pid", pid.to_string());
        crate::store::Store::write_atomic(&state_path(dir, &id), &kf.to_string())?;

        Ok(Self {
            id,
            who,
            pid,
            statefile: Some(state_path(dir, &id)),
            fifopath: None,
        })
    }

    /// Creates the guard's FIFO (mode 0600, `EEXIST` ignored), opens a
    /// non-blocking read side for the daemon to watch and a non-blocking
    /// write side to hand to the requesting client.
    ///
    /// Returns the write-side file descriptor; the daemon should pass it
    /// to the client (e.g. over the bus reply or a pre-opened fd) and
    /// await [`Guard::wait_released`] to learn when the client's end
    /// closes.
    pub fn monitor(&mut self, dir: &Path) -> Result<(AsyncFd<File>, OwnedFd)> {
        let path = fifo_path(dir, &self.id);

        match unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => {}
            Err(Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }
        self.fifopath = Some(path.clone());

        let read_fd = fcntl::open(&path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())?;
        let write_fd = fcntl::open(&path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty())?;

        let read_file: File = unsafe { std::os::fd::FromRawFd::from_raw_fd(read_fd) };
        let write_fd: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(write_fd) };

        Ok((AsyncFd::new(read_file)?, write_fd))
    }

    /// Waits for the client's write side to close (observed as EOF on
    /// the read side made ready). Does not consume `self`; callers
    /// typically run this inside a spawned task and remove files on
    /// return.
    pub async fn wait_released(read_fd: &AsyncFd<File>) -> Result<()> {
        loop {
            let mut guard = read_fd.readable().await?;
            let mut buf = [0u8; 1];
            match guard.try_io(|inner| {
                use std::io::Read;
                inner.get_ref().try_clone()?.read(&mut buf)
            }) {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => continue, // unexpected data; keep waiting for EOF
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Removes the state file and FIFO, if present. Safe to call more
    /// than once.
    pub fn unlink(&self) {
        if let Some(path) = &self.statefile {
            let _ = fs::remove_file(path);
        }
        if let Some(path) = &self.fifopath {
            let _ = fs::remove_file(path);
        }
    }

    /// Scans `dir` for `*.guard` files and reconstructs the guards whose
    /// owning process is still alive and whose FIFO still exists.
    /// Anything else is discarded (and cleaned up) per spec.md §4.6.
    pub fn recover(dir: &Path) -> Result<Vec<Guard>> {
        let mut guards = Vec::new();
        if !dir.exists() {
            return Ok(guards);
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".guard") else {
                continue;
            };
            if id.ends_with(".fifo") {
                continue;
            }

            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let kf = KeyFile::parse(&text);
            let (Some(who), Some(pid)) = (
                kf.get("guard", "who"),
                kf.get("guard", "pid").and_then(|p| p.parse::<i32>().ok()),
            ) else {
                warn!(guard = id, "malformed guard state file, discarding");
                let _ = fs::remove_file(&path);
                continue;
            };

            let fifo = fifo_path(dir, id);
            if !fifo.exists() {
                debug!(guard = id, "no fifo for guard, discarding as internal");
                let _ = fs::remove_file(&path);
                continue;
            }

            if !pid_alive(pid) {
                debug!(guard = id, pid, "owning pid is dead, reaping guard");
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(&fifo);
                continue;
            }

            guards.push(Guard {
                id: id.to_string(),
                who: who.to_string(),
                pid,
                statefile: Some(path),
                fifopath: Some(fifo),
            });
        }

        Ok(guards)
    }
}

pub fn pid_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[allow(dead_code)]
fn ensure_fd_valid(fd: &OwnedFd) -> i32 {
    fd.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_writes_parseable_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Guard::create(dir.path(), "boltctl", std::process::id() as i32).unwrap();

        let text = fs::read_to_string(state_path(dir.path(), &guard.id)).unwrap();
        let kf = KeyFile::parse(&text);
        assert_eq!(kf.get("guard", "who"), Some("boltctl"));
        assert_eq!(
            kf.get("guard", "pid"),
            Some(std::process::id().to_string()).as_deref()
        );
    }

    #[test]
    fn unlink_removes_state_file_and_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = Guard::create(dir.path(), "boltctl", std::process::id() as i32).unwrap();
        let _fds = guard.monitor(dir.path()).unwrap();

        assert!(state_path(dir.path(), &guard.id).exists());
        assert!(fifo_path(dir.path(), &guard.id).exists());

        guard.unlink();

        assert!(!state_path(dir.path(), &guard.id).exists());
        assert!(!fifo_path(dir.path(), &guard.id).exists());
    }

    #[test]
    fn recover_discards_guard_with_no_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Guard::create(dir.path(), "boltctl", std::process::id() as i32).unwrap();

        let recovered = Guard::recover(dir.path()).unwrap();
        assert!(recovered.is_empty());
        assert!(!state_path(dir.path(), &guard.id).exists());
    }

    #[test]
    fn recover_discards_guard_with_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = Guard::create(dir.path(), "boltctl", 999_999).unwrap();
        let _fds = guard.monitor(dir.path()).unwrap();

        let recovered = Guard::recover(dir.path()).unwrap();
        assert!(recovered.is_empty());
        assert!(!state_path(dir.path(), &guard.id).exists());
        assert!(!fifo_path(dir.path(), &guard.id).exists());
    }

    #[test]
    fn recover_keeps_guard_with_live_pid_and_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = Guard::create(dir.path(), "boltctl", std::process::id() as i32).unwrap();
        let _fds = guard.monitor(dir.path()).unwrap();

        let recovered = Guard::recover(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, guard.id);
    }
}
