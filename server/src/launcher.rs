//! Game catalog and the single active game slot

use crate::error::LaunchError;
use crate::process::{GameProcess, DEFAULT_GRACE_PERIOD};
use log::{info, warn};
use shared::GameDescriptor;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The game currently owned by the launcher
#[derive(Debug)]
struct ActiveGame {
    game_id: String,
    title: String,
    process: GameProcess,
}

/// Point-in-time view of the active slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LauncherStatus {
    pub game_id: Option<String>,
    pub title: Option<String>,
    pub running: bool,
}

/// Result of a successful launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedGame {
    pub game_id: String,
    pub title: String,
    pub pid: u32,
}

/// Owns the catalog and at most one running game.
///
/// `launch` and `end` take the async `lifecycle` lock for their whole
/// teardown-then-spawn sequence, so two children never coexist even when
/// launches race. The slot itself sits behind a plain mutex that is only
/// held for quick swaps, so status queries never wait on a slow shutdown.
pub struct GameLauncher {
    catalog: BTreeMap<String, GameDescriptor>,
    grace_period: Duration,
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveGame>>,
}

impl GameLauncher {
    pub fn new(games: impl IntoIterator<Item = GameDescriptor>) -> Self {
        let catalog = games
            .into_iter()
            .map(|game| (game.id.clone(), game))
            .collect();

        Self {
            catalog,
            grace_period: DEFAULT_GRACE_PERIOD,
            lifecycle: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    /// Sets how long a game may take to exit after the polite stop request
    /// before it is killed.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// All descriptors, ordered by id.
    pub fn catalog(&self) -> Vec<GameDescriptor> {
        self.catalog.values().cloned().collect()
    }

    /// Looks up one catalog entry by id.
    pub fn descriptor(&self, game_id: &str) -> Option<&GameDescriptor> {
        self.catalog.get(game_id)
    }

    /// Replaces whatever is running with `game_id`.
    ///
    /// An unknown id fails before the current game is touched. A failure to
    /// stop the previous game is logged and the launch goes ahead; a failure
    /// to start the new one leaves the slot empty.
    pub async fn launch(&self, game_id: &str) -> Result<LaunchedGame, LaunchError> {
        let descriptor = self
            .catalog
            .get(game_id)
            .ok_or_else(|| LaunchError::UnknownGame(game_id.to_string()))?;

        let _lifecycle = self.lifecycle.lock().await;

        if let Some(previous) = self.take_active() {
            info!("Replacing {} with {}", previous.title, descriptor.title);
            Self::shut_down(previous).await;
        }

        let mut process =
            GameProcess::from_descriptor(descriptor).with_grace_period(self.grace_period);
        let pid = process.start()?;

        *self.slot() = Some(ActiveGame {
            game_id: descriptor.id.clone(),
            title: descriptor.title.clone(),
            process,
        });

        info!("Launched {} ({}) as pid {}", descriptor.title, descriptor.id, pid);
        Ok(LaunchedGame {
            game_id: descriptor.id.clone(),
            title: descriptor.title.clone(),
            pid,
        })
    }

    /// Stops the active game, if any. Returns whether a live game was ended.
    pub async fn end(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(mut active) = self.take_active() else {
            return false;
        };
        let was_running = active.process.is_running();
        info!("Ending {}", active.title);
        Self::shut_down(active).await;
        was_running
    }

    /// Current slot contents. A game found to have exited on its own is
    /// cleared from the slot.
    pub fn status(&self) -> LauncherStatus {
        let mut slot = self.slot();
        let Some(active) = slot.as_mut() else {
            return LauncherStatus::default();
        };

        if active.process.is_running() {
            return LauncherStatus {
                game_id: Some(active.game_id.clone()),
                title: Some(active.title.clone()),
                running: true,
            };
        }

        info!(
            "{} is no longer running ({:?}), clearing active game",
            active.title,
            active.process.exit_status()
        );
        *slot = None;
        LauncherStatus::default()
    }

    pub fn is_running(&self) -> bool {
        self.status().running
    }

    fn take_active(&self) -> Option<ActiveGame> {
        self.slot().take()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveGame>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Best effort: a failure is logged and the handle is dropped anyway,
    /// which still sends a kill.
    async fn shut_down(mut active: ActiveGame) {
        if let Err(e) = active.process.terminate().await {
            warn!("Could not stop {} cleanly: {}", active.title, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn game(id: &str, executable: &str, arguments: &str) -> GameDescriptor {
        GameDescriptor {
            id: id.into(),
            title: format!("Game {}", id),
            executable_path: executable.into(),
            working_directory: String::new(),
            arguments: arguments.into(),
            description: String::new(),
            image_url: String::new(),
            min_duration_seconds: 60,
            max_duration_seconds: 1800,
        }
    }

    fn launcher() -> GameLauncher {
        GameLauncher::new(vec![
            game("g1", "sleep", "30"),
            game("g2", "sleep", "30"),
            game("broken", "/no/such/binary", ""),
        ])
        .with_grace_period(Duration::from_millis(500))
    }

    /// Tests catalog ordering
    #[test]
    fn test_catalog_is_ordered_by_id() {
        let launcher = launcher();
        let ids: Vec<String> = launcher.catalog().into_iter().map(|g| g.id).collect();
        assert_eq!(ids, vec!["broken", "g1", "g2"]);
        assert!(launcher.descriptor("g1").is_some());
        assert!(launcher.descriptor("nope").is_none());
    }

    /// Tests the idle status
    #[test]
    fn test_status_when_idle() {
        let launcher = launcher();
        assert_eq!(launcher.status(), LauncherStatus::default());
        assert!(!launcher.is_running());
    }

    /// Tests launching and ending a game
    #[tokio::test]
    async fn test_launch_and_end() {
        let launcher = launcher();

        let launched = assert_ok!(launcher.launch("g1").await);
        assert_eq!(launched.game_id, "g1");
        assert_eq!(launched.title, "Game g1");

        let status = launcher.status();
        assert!(status.running);
        assert_eq!(status.game_id.as_deref(), Some("g1"));

        assert!(launcher.end().await);
        assert!(!launcher.is_running());
        assert!(!launcher.end().await);
    }

    /// Tests that an unknown id does not disturb the running game
    #[tokio::test]
    async fn test_unknown_game_leaves_active_untouched() {
        let launcher = launcher();
        assert_ok!(launcher.launch("g1").await);

        let err = assert_err!(launcher.launch("missing").await);
        assert!(matches!(err, LaunchError::UnknownGame(id) if id == "missing"));

        assert_eq!(launcher.status().game_id.as_deref(), Some("g1"));
        launcher.end().await;
    }

    /// Tests that a failed spawn leaves no active game
    #[tokio::test]
    async fn test_spawn_failure_clears_slot() {
        let launcher = launcher();
        assert_ok!(launcher.launch("g1").await);

        let err = assert_err!(launcher.launch("broken").await);
        assert!(matches!(err, LaunchError::Process(_)));
        assert_eq!(launcher.status(), LauncherStatus::default());
    }

    /// Tests that a new launch replaces the running game
    #[tokio::test]
    async fn test_relaunch_replaces_previous_game() {
        let launcher = launcher();
        let first = assert_ok!(launcher.launch("g1").await);
        let second = assert_ok!(launcher.launch("g2").await);

        assert_ne!(first.pid, second.pid);
        assert_eq!(launcher.status().game_id.as_deref(), Some("g2"));
        launcher.end().await;
    }

    /// Tests that a game exiting on its own is noticed
    #[tokio::test]
    async fn test_exited_game_is_cleared() {
        let launcher = GameLauncher::new(vec![game("quick", "true", "")]);
        assert_ok!(launcher.launch("quick").await);

        let mut attempts = 0;
        while launcher.is_running() && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            attempts += 1;
        }

        assert_eq!(launcher.status(), LauncherStatus::default());
        assert!(!launcher.end().await);
    }

    /// Tests that racing launches leave exactly one game
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_launches_leave_one_game() {
        let launcher = Arc::new(launcher());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let launcher = Arc::clone(&launcher);
                let id = if i % 2 == 0 { "g1" } else { "g2" };
                tokio::spawn(async move { launcher.launch(id).await })
            })
            .collect();

        let mut pids = Vec::new();
        for handle in handles {
            let launched = assert_ok!(handle.await.unwrap());
            pids.push(launched.pid);
        }

        assert!(launcher.is_running());
        let survivors = pids
            .iter()
            .filter(|pid| {
                std::fs::read_to_string(format!("/proc/{}/stat", pid))
                    .map(|stat| !stat.contains(") Z"))
                    .unwrap_or(false)
            })
            .count();
        if cfg!(target_os = "linux") {
            assert_eq!(survivors, 1);
        }

        launcher.end().await;
    }
}
