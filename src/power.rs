// boltd - Thunderbolt/USB4 device authorization daemon
//
// Thin controller over the kernel force-power attribute. See spec.md
// §4.6. Reference counting itself lives here; FIFO-based liveness
// tracking is [`crate::guard::Guard`]'s job — this module just decides
// when the live set transitions empty <-> non-empty.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::guard::Guard;

pub struct Power {
    attr_path: PathBuf,
    guards_dir: PathBuf,
    live: HashSet<String>,
}

impl Power {
    pub fn new(attr_path: impl Into<PathBuf>, guards_dir: impl Into<PathBuf>) -> Self {
        Self {
            attr_path: attr_path.into(),
            guards_dir: guards_dir.into(),
            live: HashSet::new(),
        }
    }

    /// `true` if the kernel exposes a `force_power` attribute at all.
    pub fn is_supported(&self) -> bool {
        self.attr_path.exists()
    }

    /// Reasserts force-power for any guards recovered from a previous run
    /// (spec.md §4.6 `Guard::recover`). Called once at startup.
    pub fn recover(&mut self) -> Result<Vec<Guard>> {
        let guards = Guard::recover(&self.guards_dir)?;
        if !guards.is_empty() {
            self.live.extend(guards.iter().map(|g| g.id.clone()));
            self.write_force_power(true)?;
        }
        Ok(guards)
    }

    /// Creates a new guard, starts its FIFO, and asserts force-power if
    /// this is the first outstanding guard. Returns the guard plus the fds
    /// needed to watch for release and hand to the client.
    pub fn acquire(
        &mut self,
        who: impl Into<String>,
        pid: i32,
    ) -> Result<(Guard, tokio::io::unix::AsyncFd<std::fs::File>, std::os::fd::OwnedFd)> {
        if !self.is_supported() {
            return Err(Error::Failed("force_power not supported by this domain".into()));
        }

        let mut guard = Guard::create(&self.guards_dir, who, pid)?;
        let (read_fd, write_fd) = guard.monitor(&self.guards_dir)?;

        let was_empty = self.live.is_empty();
        self.live.insert(guard.id.clone());
        if was_empty {
            info!("asserting force_power (first guard acquired)");
            self.write_force_power(true)?;
        }

        Ok((guard, read_fd, write_fd))
    }

    /// Releases the guard with the given id. De-asserts force-power once
    /// the live set becomes empty.
    pub fn release(&mut self, id: &str) -> Result<()> {
        self.live.remove(id);
        if self.live.is_empty() {
            info!("de-asserting force_power (last guard released)");
            self.write_force_power(false)?;
        }
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_powered(&self) -> Result<bool> {
        let contents = fs::read_to_string(&self.attr_path)?;
        Ok(contents.trim() == "1")
    }

    fn write_force_power(&self, on: bool) -> Result<()> {
        fs::write(&self.attr_path, if on { "1" } else { "0" })?;
        Ok(())
    }
}

#[allow(dead_code)]
fn attr_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Power) {
        let dir = tempfile::tempdir().unwrap();
        let attr = dir.path().join("force_power");
        fs::write(&attr, "0").unwrap();
        let power = Power::new(attr, dir.path().join("guards"));
        (dir, power)
    }

    #[test]
    fn unsupported_when_attribute_missing() {
        let dir = tempfile::tempdir().unwrap();
        let power = Power::new(dir.path().join("force_power"), dir.path().join("guards"));
        assert!(!power.is_supported());
    }

    #[test]
    fn three_guards_keep_power_asserted_until_last_release() {
        let (_dir, mut power) = setup();
        assert!(!power.is_powered().unwrap());

        let (g1, _, _) = power.acquire("client-a", std::process::id() as i32).unwrap();
        assert!(power.is_powered().unwrap());

        let (g2, _, _) = power.acquire("client-b", std::process::id() as i32).unwrap();
        let (g3, _, _) = power.acquire("client-c", std::process::id() as i32).unwrap();
        assert!(power.is_powered().unwrap());

        power.release(&g2.id).unwrap();
        assert!(power.is_powered().unwrap(), "still 2 live guards");

        power.release(&g1.id).unwrap();
        assert!(power.is_powered().unwrap(), "still 1 live guard");

        power.release(&g3.id).unwrap();
        assert!(!power.is_powered().unwrap(), "last guard released");
    }
}
