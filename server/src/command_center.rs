//! The command center ties the launcher, session timer and resource poller
//! to the command router and broadcasts the combined status to clients.
//!
//! Each component guards its own state; nothing here holds a lock spanning
//! several of them. An aggregate status is therefore assembled from
//! independent reads and may briefly pair, say, a just-stopped timer with the
//! title of a game that is still being shut down. The next broadcast
//! corrects it.
//!
//! Command handlers that change the session (launch, end, pause, resume)
//! are serialised by a session lock so a launch and its timer start can
//! never interleave with another launch. Status queries never take it.
//! Once shutdown has taken the session lock, launch, pause and resume are
//! refused.

use crate::error::CommandError;
use crate::launcher::GameLauncher;
use crate::monitor::{ResourcePoller, ResourceSampler, DEFAULT_POLL_INTERVAL};
use crate::process::DEFAULT_GRACE_PERIOD;
use crate::router::{broadcast_response, CommandContext, CommandRouter};
use crate::timer::{SessionTimer, TimerEvent, DEFAULT_TICK_PERIOD};
use crate::transport::{ConnectionId, MessageHandler, Outbox};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::json;
use shared::{timestamp_millis, AggregateStatus, CommandName, GameDescriptor, Response};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Timer ticks at or below this many remaining seconds are always broadcast.
const FINAL_COUNTDOWN_SECS: u32 = 60;

/// Outside the final countdown, ticks are broadcast on multiples of this.
const TICK_BROADCAST_EVERY_SECS: u32 = 10;

const MIN_RATING: i64 = 1;
const MAX_RATING: i64 = 5;

#[derive(Debug, Clone)]
pub struct CenterOptions {
    /// Unsolicited status broadcast period; `None` disables it
    pub status_interval: Option<Duration>,
    pub poll_interval: Duration,
    pub termination_grace: Duration,
    pub timer_tick: Duration,
}

impl Default for CenterOptions {
    fn default() -> Self {
        Self {
            status_interval: Some(Duration::from_secs(5)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            termination_grace: DEFAULT_GRACE_PERIOD,
            timer_tick: DEFAULT_TICK_PERIOD,
        }
    }
}

struct Shared {
    launcher: GameLauncher,
    timer: SessionTimer,
    poller: ResourcePoller,
    outbox: Arc<dyn Outbox>,
    session: tokio::sync::Mutex<()>,
    /// Set under the session lock when shutdown begins
    shutting_down: AtomicBool,
    /// Ratings per game id, kept for the life of the process
    ratings: Mutex<HashMap<String, Vec<u8>>>,
}

impl Shared {
    fn aggregate_status(&self) -> AggregateStatus {
        let game = self.launcher.status();
        let timer = self.timer.snapshot();
        let resources = self.poller.stats();

        AggregateStatus {
            connected: true,
            active_game: game.title,
            active_game_id: game.game_id,
            game_running: game.running,
            is_paused: timer.is_paused(),
            time_remaining: timer.remaining,
            session_duration: if timer.is_active() { timer.total } else { 0 },
            cpu_usage: resources.cpu_usage,
            memory_usage: resources.memory_usage,
            disk_space: resources.disk_space_mb,
        }
    }

    fn broadcast_status(&self) -> usize {
        let response = Response::status_update(&self.aggregate_status());
        broadcast_response(self.outbox.as_ref(), &response)
    }

    /// Must be called with the session lock held.
    fn refuse_if_shutting_down(&self) -> Result<(), CommandError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CommandError::InvalidState("Server is shutting down".into()));
        }
        Ok(())
    }

    async fn launch_game(&self, ctx: CommandContext) {
        let game_id = ctx.params.text("gameId");
        let duration = ctx.params.integer("sessionDuration");
        let (Some(game_id), Some(duration)) = (game_id, duration) else {
            ctx.reply(Err(CommandError::Validation(
                "Missing required parameters: gameId and/or sessionDuration".into(),
            )));
            return;
        };

        let descriptor = self.launcher.descriptor(&game_id);
        let duration = match validate_duration(descriptor, &game_id, duration) {
            Ok(duration) => duration,
            Err(e) => {
                ctx.reply(Err(e));
                return;
            }
        };

        info!("launchGame {} for {}s", game_id, duration);
        let _session = self.session.lock().await;
        if let Err(e) = self.refuse_if_shutting_down() {
            ctx.reply(Err(e));
            return;
        }

        let launched = match self.launcher.launch(&game_id).await {
            Ok(launched) => launched,
            Err(e) => {
                let stopped = self.timer.stop().await;
                ctx.reply(Err(e.into()));
                if stopped {
                    self.broadcast_status();
                }
                return;
            }
        };

        self.timer.stop().await;
        if let Err(e) = self.timer.start(duration) {
            warn!("Timer refused to start: {}", e);
            ctx.reply(Err(e.into()));
            return;
        }

        ctx.reply_success(json!({
            "gameId": launched.game_id,
            "title": launched.title,
            "running": true,
            "sessionDuration": duration,
        }));
        self.broadcast_status();
    }

    async fn end_session(&self, ctx: CommandContext) {
        let _session = self.session.lock().await;

        let game_ended = self.launcher.end().await;
        let timer_stopped = self.timer.stop().await;
        info!(
            "endSession (game ended: {}, timer stopped: {})",
            game_ended, timer_stopped
        );

        ctx.reply_success(json!({
            "wasRunning": game_ended || timer_stopped,
            "message": "Session ended successfully",
        }));
        self.broadcast_status();
    }

    async fn pause_session(&self, ctx: CommandContext) {
        let _session = self.session.lock().await;
        let timer = self.timer.snapshot();

        let result = if let Err(e) = self.refuse_if_shutting_down() {
            Err(e)
        } else if !self.launcher.is_running() || !timer.is_active() {
            Err(CommandError::InvalidState("No active session to pause".into()))
        } else if timer.is_paused() {
            Err(CommandError::InvalidState("Session is already paused".into()))
        } else {
            self.timer
                .pause()
                .map(|remaining| json!({ "paused": true, "timeRemaining": remaining }))
                .map_err(CommandError::from)
        };

        let changed = result.is_ok();
        ctx.reply(result);
        if changed {
            self.broadcast_status();
        }
    }

    async fn resume_session(&self, ctx: CommandContext) {
        let _session = self.session.lock().await;
        let timer = self.timer.snapshot();

        let result = if let Err(e) = self.refuse_if_shutting_down() {
            Err(e)
        } else if !self.launcher.is_running() || !timer.is_active() {
            Err(CommandError::InvalidState("No active session to resume".into()))
        } else if !timer.is_paused() {
            Err(CommandError::InvalidState("Session is not paused".into()))
        } else {
            self.timer
                .resume()
                .map(|remaining| json!({ "paused": false, "timeRemaining": remaining }))
                .map_err(CommandError::from)
        };

        let changed = result.is_ok();
        ctx.reply(result);
        if changed {
            self.broadcast_status();
        }
    }

    fn get_status(&self, ctx: CommandContext) {
        ctx.reply_success(json!({ "status": self.aggregate_status() }));
    }

    fn get_games(&self, ctx: CommandContext) {
        ctx.reply_success(json!({ "games": self.launcher.catalog() }));
    }

    fn submit_rating(&self, ctx: CommandContext) {
        let Some(game_id) = ctx.params.text("gameId") else {
            ctx.reply(Err(CommandError::Validation("Missing gameId parameter".into())));
            return;
        };
        let rating = match validate_rating(ctx.params.integer("rating")) {
            Ok(rating) => rating,
            Err(e) => {
                ctx.reply(Err(e));
                return;
            }
        };

        let average = {
            let mut ratings = lock(&self.ratings);
            let game_ratings = ratings.entry(game_id.clone()).or_default();
            game_ratings.push(rating);
            average_rating(game_ratings)
        };
        info!("Rating of {} submitted for game {}", rating, game_id);

        ctx.reply_success(json!({
            "gameId": game_id,
            "rating": rating,
            "avgRating": average,
            "message": "Rating submitted successfully",
        }));
    }

    async fn on_timer_event(&self, event: TimerEvent) {
        match event {
            TimerEvent::Tick { remaining } => {
                if should_broadcast_tick(remaining) {
                    self.broadcast_status();
                }
            }
            TimerEvent::Expired => {
                let _session = self.session.lock().await;
                // A launch may have started a new session since the event was sent.
                if self.timer.is_active() {
                    debug!("Ignoring expiry of a replaced session");
                    return;
                }
                info!("Session time is up, ending game");
                self.launcher.end().await;
                self.broadcast_status();
            }
            other => debug!("Timer: {:?}", other),
        }
    }
}

fn should_broadcast_tick(remaining: u32) -> bool {
    remaining <= FINAL_COUNTDOWN_SECS || remaining % TICK_BROADCAST_EVERY_SECS == 0
}

/// Checks the requested duration against the game's allowed range.
fn validate_duration(
    descriptor: Option<&GameDescriptor>,
    game_id: &str,
    duration: i64,
) -> Result<u32, CommandError> {
    let descriptor =
        descriptor.ok_or_else(|| CommandError::NotFound(format!("Game not found: {}", game_id)))?;

    let duration = u32::try_from(duration)
        .ok()
        .filter(|d| *d > 0)
        .ok_or_else(|| {
            CommandError::Validation("sessionDuration must be a positive number of seconds".into())
        })?;

    if !descriptor.allows_duration(duration) {
        return Err(CommandError::Validation(format!(
            "Session duration must be between {} and {} seconds for {}",
            descriptor.min_duration_seconds, descriptor.max_duration_seconds, descriptor.title
        )));
    }
    Ok(duration)
}

/// Accepts whole-number ratings from one to five stars.
fn validate_rating(rating: Option<i64>) -> Result<u8, CommandError> {
    let rating = rating.ok_or_else(|| CommandError::Validation("Invalid rating value".into()))?;
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(CommandError::Validation(format!(
            "Rating must be between {} and {}",
            MIN_RATING, MAX_RATING
        )));
    }
    u8::try_from(rating).map_err(|_| CommandError::Validation("Invalid rating value".into()))
}

fn average_rating(ratings: &[u8]) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    let total: u32 = ratings.iter().map(|r| u32::from(*r)).sum();
    f64::from(total) / ratings.len() as f64
}

struct StatusLoop {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Orchestrates the kiosk: owns the components, registers the command
/// handlers and runs the status broadcast loop.
pub struct CommandCenter {
    shared: Arc<Shared>,
    router: Arc<CommandRouter>,
    status_interval: Option<Duration>,
    timer_events: Mutex<Option<mpsc::UnboundedReceiver<TimerEvent>>>,
    status_loop: Mutex<Option<StatusLoop>>,
}

impl CommandCenter {
    pub fn new(
        games: Vec<GameDescriptor>,
        outbox: Arc<dyn Outbox>,
        sampler: impl ResourceSampler,
        options: CenterOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            launcher: GameLauncher::new(games).with_grace_period(options.termination_grace),
            timer: SessionTimer::new(events_tx).with_tick_period(options.timer_tick),
            poller: ResourcePoller::new(sampler, options.poll_interval),
            outbox: Arc::clone(&outbox),
            session: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            ratings: Mutex::new(HashMap::new()),
        });

        let mut router = CommandRouter::new(outbox);
        register(&mut router, &shared, CommandName::LaunchGame, |shared, ctx| async move {
            shared.launch_game(ctx).await
        });
        register(&mut router, &shared, CommandName::EndSession, |shared, ctx| async move {
            shared.end_session(ctx).await
        });
        register(&mut router, &shared, CommandName::PauseSession, |shared, ctx| async move {
            shared.pause_session(ctx).await
        });
        register(&mut router, &shared, CommandName::ResumeSession, |shared, ctx| async move {
            shared.resume_session(ctx).await
        });
        register(&mut router, &shared, CommandName::GetStatus, |shared, ctx| async move {
            shared.get_status(ctx)
        });
        register(&mut router, &shared, CommandName::GetGames, |shared, ctx| async move {
            shared.get_games(ctx)
        });
        register(&mut router, &shared, CommandName::Heartbeat, |_shared, ctx| async move {
            ctx.reply_success(json!({ "timestamp": timestamp_millis() }));
        });
        register(&mut router, &shared, CommandName::SubmitRating, |shared, ctx| async move {
            shared.submit_rating(ctx)
        });
        info!("Registered commands: {}", router.commands().join(", "));

        Self {
            shared,
            router: Arc::new(router),
            status_interval: options.status_interval.filter(|d| !d.is_zero()),
            timer_events: Mutex::new(Some(events_rx)),
            status_loop: Mutex::new(None),
        }
    }

    /// Starts the resource poller and the status loop.
    pub fn start(&self) {
        self.shared.poller.start();

        let Some(events) = lock(&self.timer_events).take() else {
            warn!("Command center already started");
            return;
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_status_loop(
            Arc::clone(&self.shared),
            events,
            self.status_interval,
            shutdown_rx,
        ));
        *lock(&self.status_loop) = Some(StatusLoop { shutdown, handle });
        info!("Command center started");
    }

    /// Ends the game, stops the timer, the status loop and the poller, then
    /// closes every connection.
    ///
    /// Session commands arriving after this point are refused, so the
    /// transport may keep delivering frames while shutdown runs.
    pub async fn shutdown(&self) {
        info!("Command center shutting down");
        {
            let _session = self.shared.session.lock().await;
            self.shared.shutting_down.store(true, Ordering::SeqCst);
            if self.shared.launcher.end().await {
                info!("Active game ended");
            }
            self.shared.timer.stop().await;
        }

        let status_loop = lock(&self.status_loop).take();
        if let Some(status_loop) = status_loop {
            let _ = status_loop.shutdown.send(());
            if let Err(e) = status_loop.handle.await {
                warn!("Status loop ended abnormally: {}", e);
            }
        }

        self.shared.poller.stop().await;

        let closed = self.shared.outbox.close_all();
        info!("Closed {} connection(s)", closed);
    }

    pub fn status(&self) -> AggregateStatus {
        self.shared.aggregate_status()
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }
}

impl MessageHandler for CommandCenter {
    fn greeting(&self) -> Option<String> {
        let welcome = Response::welcome(&self.shared.aggregate_status());
        match welcome.to_json() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to encode welcome: {}", e);
                None
            }
        }
    }

    fn on_connect(&self, connection: ConnectionId) {
        debug!("Connection {} joined", connection);
    }

    fn on_message(&self, connection: ConnectionId, text: String) -> BoxFuture<'static, ()> {
        let router = Arc::clone(&self.router);
        Box::pin(async move {
            router.dispatch(connection, &text).await;
        })
    }

    fn on_disconnect(&self, connection: ConnectionId) {
        debug!("Connection {} left", connection);
    }
}

fn register<F, Fut>(
    router: &mut CommandRouter,
    shared: &Arc<Shared>,
    name: CommandName,
    handler: F,
) where
    F: Fn(Arc<Shared>, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shared = Arc::clone(shared);
    router.register(name.as_str(), move |ctx| handler(Arc::clone(&shared), ctx));
}

async fn run_status_loop(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TimerEvent>,
    status_interval: Option<Duration>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut periodic = status_interval.map(|period| {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticks
    });

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => shared.on_timer_event(event).await,
                None => break,
            },
            _ = next_tick(&mut periodic) => {
                if shared.outbox.connection_count() > 0 {
                    shared.broadcast_status();
                }
            }
        }
    }

    debug!("Status loop stopped");
}

async fn next_tick(periodic: &mut Option<Interval>) {
    match periodic {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
