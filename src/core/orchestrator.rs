//! Session orchestrator - Owns every idle session and the card-farming queue
//!
//! The orchestrator runs as a single task. Front-end actions, dispatcher
//! notifications and scrape results all arrive as [`Command`]s, and every
//! timer is a deadline polled by the same loop, so state changes never
//! interleave.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::app::{sort_by_price_desc, App, AppId};
use super::badges::BadgeSource;
use super::process::Supervisor;
use super::session::{Command, Session, SessionEvent, StatusSnapshot, StopReport};
use super::settings::Settings;
use super::timers::{self, TimerKind, Timers};
use crate::web::ScrapeError;

/// Hidden placeholder apps launched on exit to push real games out of the
/// "recently played" list
pub const RECENTLY_PLAYED_PLACEHOLDERS: [AppId; 3] = [AppId(399220), AppId(399080), AppId(399480)];

const COMMAND_CAPACITY: usize = 64;

/// The orchestrator task has ended
#[derive(Debug, thiserror::Error)]
#[error("orchestrator is no longer running")]
pub struct OrchestratorClosed;

/// Cloneable sender side used by the front-end and the dispatcher
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    pub async fn send(&self, command: Command) -> Result<(), OrchestratorClosed> {
        self.commands.send(command).await.map_err(|_| OrchestratorClosed)
    }

    /// Send from a non-async thread
    pub fn blocking_send(&self, command: Command) -> Result<(), OrchestratorClosed> {
        self.commands
            .blocking_send(command)
            .map_err(|_| OrchestratorClosed)
    }

    pub async fn status(&self) -> Result<StatusSnapshot, OrchestratorClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| OrchestratorClosed)
    }

    /// A handle whose commands land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        (Self { commands: tx }, rx)
    }
}

/// An app in the active set. `handle` is `None` when the last spawn failed.
#[derive(Debug)]
pub struct ActiveApp<H> {
    pub app: App,
    pub handle: Option<H>,
}

pub struct Orchestrator<S: Supervisor, B: BadgeSource> {
    supervisor: S,
    badges: Arc<B>,
    settings: Arc<RwLock<Settings>>,
    commands: mpsc::Receiver<Command>,
    /// Used by scrape tasks to post their results back
    results: mpsc::WeakSender<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    session_tx: watch::Sender<Session>,

    session: Session,
    active: Vec<ActiveApp<S::Handle>>,
    queue: Vec<App>,
    current: Option<AppId>,
    timers: Timers,
    idle_started: Option<Instant>,
    load_token: u64,
    pending_load: Option<u64>,
}

impl<S: Supervisor, B: BadgeSource> Orchestrator<S, B> {
    pub fn new(
        supervisor: S,
        badges: Arc<B>,
        settings: Arc<RwLock<Settings>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, OrchestratorHandle, watch::Receiver<Session>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (session_tx, session_rx) = watch::channel(Session::None);

        let orchestrator = Self {
            supervisor,
            badges,
            settings,
            commands: rx,
            results: tx.downgrade(),
            events,
            session_tx,
            session: Session::None,
            active: Vec::new(),
            queue: Vec::new(),
            current: None,
            timers: Timers::default(),
            idle_started: None,
            load_token: 0,
            pending_load: None,
        };

        (orchestrator, OrchestratorHandle { commands: tx }, session_rx)
    }

    /// Serve commands and timers until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Session orchestrator started");

        loop {
            let next = self.timers.next_due();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        info!("All command senders dropped");
                        self.shutdown();
                        break;
                    }
                },
                _ = timers::wait_for(next.map(|(_, at)| at)) => {
                    if let Some((kind, _)) = next {
                        self.timers.disarm(kind);
                        self.on_timer(kind);
                    }
                }
            }
        }

        info!("Session orchestrator stopped");
    }

    /// Apply one command. Returns `false` once the loop should end.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::StartIdle(apps) => self.start_idle(apps),
            Command::StartCards => self.start_cards(),
            Command::SkipCurrent => {
                if self.session.is_farming() {
                    self.start_next_card();
                } else {
                    warn!("Not farming cards, nothing to skip");
                }
            }
            Command::BlacklistCurrent => self.blacklist_current(),
            Command::CheckCurrentBadge => self.check_current_badge(),
            Command::ItemDropped { new_items } => self.on_item_dropped(new_items),
            Command::Stop => {
                self.stop_apps(true);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {
                self.shutdown();
                return false;
            }
            Command::BadgesLoaded { token, result } => self.on_badges_loaded(token, result),
            Command::BadgeChecked { appid, result } => self.on_badge_checked(appid, result),
        }
        true
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let settings = self.settings();
        match kind {
            TimerKind::Progress => {
                self.check_current_badge();
                self.timers
                    .arm(kind, timers::minutes(settings.progress_check_minutes));
            }
            TimerKind::BatchAdvance => {
                info!("Batch interval elapsed, reloading badges");
                self.load_badges();
                self.timers
                    .arm(kind, timers::minutes(settings.batch_check_minutes));
            }
            TimerKind::Watchdog => {
                self.watchdog();
                self.timers.arm(
                    kind,
                    std::time::Duration::from_secs(u64::from(settings.process_check_secs)),
                );
            }
            TimerKind::Restart => {
                self.restart_processes(settings.restart_games_at_random);
                self.timers
                    .arm(kind, timers::restart_interval(settings.restart_games_minutes));
            }
        }
    }

    /// Launch a process for every app and arm the timers of `session`
    pub fn start_apps(&mut self, session: Session, mut apps: Vec<App>) {
        if apps.is_empty() {
            warn!("No apps to start for {:?} session", session);
            return;
        }

        let settings = self.settings();
        if apps.len() > settings.max_concurrent_apps {
            warn!(
                "Limiting session to {} of {} apps",
                settings.max_concurrent_apps,
                apps.len()
            );
            apps.truncate(settings.max_concurrent_apps);
        }

        let mut active = Vec::with_capacity(apps.len());
        for app in apps {
            let handle = match self.supervisor.spawn(&app) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to start {}: {}", app.id_and_name(), e);
                    None
                }
            };
            active.push(ActiveApp { app, handle });
        }
        self.active = active;

        match session {
            Session::Cards => self
                .timers
                .arm(TimerKind::Progress, timers::minutes(settings.progress_check_minutes)),
            Session::CardsBatch => self.timers.arm(
                TimerKind::BatchAdvance,
                timers::minutes(settings.batch_check_minutes),
            ),
            Session::Idle | Session::None => {}
        }
        self.timers.arm(
            TimerKind::Watchdog,
            std::time::Duration::from_secs(u64::from(settings.process_check_secs)),
        );
        if settings.restart_games || session != Session::CardsBatch {
            self.timers.arm(
                TimerKind::Restart,
                timers::restart_interval(settings.restart_games_minutes),
            );
        }

        self.idle_started = Some(Instant::now());
        self.set_session(session);

        let apps: Vec<App> = self.active.iter().map(|a| a.app.clone()).collect();
        info!("{} started with {} app(s)", session, apps.len());
        self.emit(SessionEvent::Started { session, apps });
    }

    /// Kill every active process. The session survives unless `kill_session`.
    pub fn stop_apps(&mut self, kill_session: bool) -> StopReport {
        if kill_session {
            self.pending_load = None;
        }
        if !self.session.is_running() {
            return StopReport::default();
        }

        self.timers.disarm_all();

        let mut report = StopReport::default();
        for mut entry in self.active.drain(..) {
            let Some(handle) = entry.handle.as_mut() else {
                continue;
            };
            report.attempted += 1;
            if let Err(e) = self.supervisor.kill(handle) {
                report.errors += 1;
                warn!("Failed to stop {}: {}", entry.app.id_and_name(), e);
            }
        }
        if report.errors > 0 {
            warn!(
                "{} of {} processes could not be stopped",
                report.errors, report.attempted
            );
        }

        if kill_session {
            self.current = None;
            self.queue.clear();
            self.idle_started = None;
            self.set_session(Session::None);
            info!("Session stopped");
            self.emit(SessionEvent::Stopped(report));
        }
        report
    }

    pub fn start_idle(&mut self, apps: Vec<App>) {
        self.stop_apps(true);

        match self.settings.write() {
            Ok(mut settings) if settings.save_app_idle_history => {
                for app in apps.iter().rev() {
                    settings.game_history_ids.retain(|id| *id != app.appid);
                    settings.game_history_ids.insert(0, app.appid);
                }
            }
            Ok(_) => {}
            Err(e) => error!("Settings lock poisoned: {}", e),
        }

        self.start_apps(Session::Idle, apps);
    }

    /// Stop whatever runs and reload the badge queue from scratch
    pub fn start_cards(&mut self) {
        self.stop_apps(true);
        self.load_badges();
    }

    /// Advance the queue to the next game worth farming
    pub fn start_next_card(&mut self) {
        if let Some(current) = self.current.take() {
            self.queue.retain(|app| app.appid != current);
        }
        self.stop_apps(false);

        if self.queue.is_empty() {
            info!("No games left with card drops");
            self.stop_apps(true);
            self.emit(SessionEvent::FarmingComplete);
            return;
        }

        let settings = self.settings();
        let next = match settings.playtime_gate() {
            Some(min) => self
                .queue
                .iter()
                .find(|app| app.minutes_played() >= min)
                .cloned(),
            None => self.queue.first().cloned(),
        };

        match next {
            Some(app) => {
                info!(
                    "Farming {} ({} cards left)",
                    app.id_and_name(),
                    app.cards_remaining()
                );
                self.current = Some(app.appid);
                self.emit(SessionEvent::CardsRemaining { app: app.clone() });
                self.start_apps(Session::Cards, vec![app]);
            }
            None => {
                let size = settings.batch_size.min(settings.max_concurrent_apps);
                let batch: Vec<App> = self.queue.iter().take(size).cloned().collect();
                info!(
                    "No game has enough playtime yet, idling a batch of {}",
                    batch.len()
                );
                self.start_apps(Session::CardsBatch, batch);
            }
        }
    }

    /// Scrape the current game's remaining drops in the background
    pub fn check_current_badge(&mut self) {
        if self.session != Session::Cards {
            return;
        }
        let Some(appid) = self.current else {
            return;
        };

        debug!("Checking card drops for app {}", appid);
        let badges = Arc::clone(&self.badges);
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = badges.cards_remaining(appid).await;
            if let Some(tx) = results.upgrade() {
                let _ = tx.send(Command::BadgeChecked { appid, result }).await;
            }
        });
    }

    pub fn blacklist_current(&mut self) {
        let Some(appid) = self.current else {
            warn!("No game is being farmed, nothing to blacklist");
            return;
        };

        match self.settings.write() {
            Ok(mut settings) => {
                settings.blacklisted_card_games.insert(appid);
            }
            Err(e) => error!("Settings lock poisoned: {}", e),
        }
        info!("Blacklisted app {}", appid);
        self.start_next_card();
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            session: self.session,
            active: self.active.iter().map(|a| a.app.clone()).collect(),
            current: self
                .current
                .and_then(|id| self.queue.iter().find(|app| app.appid == id).cloned()),
            queue_len: self.queue.len(),
            idle_elapsed: self
                .idle_started
                .map(|started| started.elapsed())
                .unwrap_or_default(),
        }
    }

    /// Stop everything before exit
    pub fn shutdown(&mut self) {
        self.stop_apps(true);

        if self.settings().clear_recently_played_on_exit {
            info!("Clearing recently played games");
            for appid in RECENTLY_PLAYED_PLACEHOLDERS {
                let app = App::new(appid, "");
                // Left running: the idle process exits on its own once we are gone
                if let Err(e) = self.supervisor.spawn(&app) {
                    warn!("Failed to launch placeholder app {}: {}", appid, e);
                }
            }
        }
    }

    fn load_badges(&mut self) {
        self.load_token += 1;
        let token = self.load_token;
        self.pending_load = Some(token);

        let blacklist: HashSet<AppId> = self
            .settings()
            .blacklisted_card_games
            .iter()
            .copied()
            .collect();
        let badges = Arc::clone(&self.badges);
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = badges.load_badges(blacklist).await;
            if let Some(tx) = results.upgrade() {
                let _ = tx.send(Command::BadgesLoaded { token, result }).await;
            }
        });
    }

    fn on_badges_loaded(&mut self, token: u64, result: Result<Vec<App>, ScrapeError>) {
        if self.pending_load != Some(token) {
            debug!("Ignoring stale badge load {}", token);
            return;
        }
        self.pending_load = None;

        let mut apps = match result {
            Ok(apps) => apps,
            Err(e) => {
                error!("Failed to load badges: {}", e);
                self.stop_apps(true);
                self.emit(SessionEvent::BadgesUnavailable(e.to_string()));
                return;
            }
        };

        let settings = self.settings();
        apps.retain(|app| app.has_cards() && !settings.is_blacklisted(app.appid));
        if settings.idle_cards_with_most_value {
            sort_by_price_desc(&mut apps);
        }

        let cards: u32 = apps.iter().map(App::cards_remaining).sum();
        info!("{} games with {} card drops left", apps.len(), cards);
        self.emit(SessionEvent::QueueLoaded {
            games: apps.len(),
            cards,
        });

        self.queue = apps;
        self.current = None;
        self.start_next_card();
    }

    fn on_badge_checked(&mut self, appid: AppId, result: Result<u32, ScrapeError>) {
        if self.session != Session::Cards || self.current != Some(appid) {
            debug!("Ignoring card count for app {} from an earlier session", appid);
            return;
        }

        let remaining = match result {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("Could not check card drops for app {}: {}", appid, e);
                return;
            }
        };

        if remaining == 0 {
            info!("All cards dropped for app {}", appid);
            self.start_next_card();
            return;
        }

        let entries = self
            .queue
            .iter_mut()
            .chain(self.active.iter_mut().map(|a| &mut a.app))
            .filter(|app| app.appid == appid);
        for app in entries {
            if let Some(card) = app.card.as_mut() {
                card.cards_remaining = remaining;
            }
        }

        if let Some(app) = self.queue.iter().find(|app| app.appid == appid) {
            info!("{} has {} cards left", app.id_and_name(), remaining);
            self.emit(SessionEvent::CardsRemaining { app: app.clone() });
        }
    }

    fn on_item_dropped(&mut self, new_items: u32) {
        if self.session != Session::Cards || new_items == 0 {
            return;
        }
        info!("{} new item(s) received, checking progress", new_items);
        let minutes = self.settings().progress_check_minutes;
        self.timers
            .arm(TimerKind::Progress, timers::minutes(minutes));
        self.check_current_badge();
    }

    /// Respawn every process that exited, leaving live ones alone
    fn watchdog(&mut self) {
        for entry in self.active.iter_mut() {
            let alive = match entry.handle.as_mut() {
                Some(handle) => self.supervisor.is_alive(handle),
                None => false,
            };
            if alive {
                continue;
            }

            warn!("{} is not running, restarting it", entry.app.id_and_name());
            match self.supervisor.spawn(&entry.app) {
                Ok(handle) => {
                    entry.handle = Some(handle);
                    let _ = self.events.send(SessionEvent::AppRestarted(entry.app.appid));
                }
                Err(e) => {
                    entry.handle = None;
                    error!("Failed to restart {}: {}", entry.app.id_and_name(), e);
                }
            }
        }
    }

    /// Kill one random process or all of them. The watchdog brings them back.
    fn restart_processes(&mut self, at_random: bool) {
        if self.active.is_empty() {
            return;
        }

        let targets: Vec<usize> = if at_random {
            vec![rand::rng().random_range(0..self.active.len())]
        } else {
            (0..self.active.len()).collect()
        };

        for index in targets {
            let entry = &mut self.active[index];
            let Some(handle) = entry.handle.as_mut() else {
                continue;
            };
            info!("Restarting {}", entry.app.id_and_name());
            if let Err(e) = self.supervisor.kill(handle) {
                warn!("Failed to restart {}: {}", entry.app.id_and_name(), e);
            }
        }
    }

    fn set_session(&mut self, session: Session) {
        self.session = session;
        self.session_tx.send_replace(session);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for session events");
        }
    }

    fn settings(&self) -> Settings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
