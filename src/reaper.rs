// boltd - Thunderbolt/USB4 device authorization daemon
//
// Polls PID liveness for entries that aren't watched via a FIFO. See
// spec.md §4.6. The reaper itself holds no timer: the main loop ticks it
// on a fixed interval (the "periodic reaper tick" suspension point of
// spec.md §5), keeping every piece of core state mutation on the one
// cooperative loop.

use std::collections::HashMap;
use std::time::Duration;

use crate::guard::pid_alive;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(20);

/// Tracks `pid -> who` pairs and reports which ones have died.
#[derive(Default)]
pub struct Reaper {
    watched: HashMap<i32, String>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, pid: i32, who: impl Into<String>) {
        self.watched.insert(pid, who.into());
    }

    pub fn unwatch(&mut self, pid: i32) {
        self.watched.remove(&pid);
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Removes and returns every `(pid, who)` whose process no longer
    /// exists. Call this on a fixed timer; the reaper has nothing to do
    /// (and the main loop should stop ticking it) once [`is_empty`]
    /// returns `true`.
    pub fn tick(&mut self) -> Vec<(i32, String)> {
        let dead: Vec<i32> = self
            .watched
            .keys()
            .copied()
            .filter(|pid| !pid_alive(*pid))
            .collect();

        dead.into_iter()
            .map(|pid| (pid, self.watched.remove(&pid).unwrap()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_never_fires_for_live_pid() {
        let mut reaper = Reaper::new();
        reaper.watch(std::process::id() as i32, "self");
        assert!(reaper.tick().is_empty());
        assert!(!reaper.is_empty());
    }

    #[test]
    fn tick_reaps_dead_pid_and_then_empties() {
        let mut reaper = Reaper::new();
        reaper.watch(999_999, "ghost");
        let died = reaper.tick();
        assert_eq!(died, vec![(999_999, "ghost".to_string())]);
        assert!(reaper.is_empty());
        assert!(reaper.tick().is_empty());
    }
}
