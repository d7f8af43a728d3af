//! Session types - Modes, commands, and events exchanged with the orchestrator

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::app::{App, AppId};
use crate::web::ScrapeError;

/// What the orchestrator is currently doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Session {
    #[default]
    None,
    /// Idling a user-chosen set of games
    Idle,
    /// Farming cards for one game at a time
    Cards,
    /// Idling a batch of games to build up playtime
    CardsBatch,
}

impl Session {
    pub fn is_running(&self) -> bool {
        !matches!(self, Session::None)
    }

    pub fn is_farming(&self) -> bool {
        matches!(self, Session::Cards | Session::CardsBatch)
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Session::None => write!(f, "Stopped"),
            Session::Idle => write!(f, "Idling"),
            Session::Cards => write!(f, "Farming cards"),
            Session::CardsBatch => write!(f, "Farming cards (batch)"),
        }
    }
}

/// Requests served by the orchestrator actor
#[derive(Debug)]
pub enum Command {
    StartIdle(Vec<App>),
    StartCards,
    /// Drop the current game from the queue and move on
    SkipCurrent,
    BlacklistCurrent,
    CheckCurrentBadge,
    ItemDropped { new_items: u32 },
    Stop,
    Status(oneshot::Sender<StatusSnapshot>),
    Shutdown,

    /// Result of a badge listing scrape started by the orchestrator
    BadgesLoaded {
        token: u64,
        result: Result<Vec<App>, ScrapeError>,
    },
    /// Result of a single game-card scrape
    BadgeChecked {
        appid: AppId,
        result: Result<u32, ScrapeError>,
    },
}

/// Outcome of stopping every active process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub attempted: usize,
    pub errors: usize,
}

/// Notifications for the front-end
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { session: Session, apps: Vec<App> },
    Stopped(StopReport),
    QueueLoaded { games: usize, cards: u32 },
    CardsRemaining { app: App },
    FarmingComplete,
    /// Badge data could not be read; the web session likely needs renewing
    BadgesUnavailable(String),
    AppRestarted(AppId),
    AccountUpdated { persona_name: String },
    PlatformUnreachable,
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub session: Session,
    pub active: Vec<App>,
    pub current: Option<App>,
    pub queue_len: usize,
    pub idle_elapsed: Duration,
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.idle_elapsed.as_secs();
        write!(
            f,
            "{} for {:02}:{:02}:{:02}, {} active",
            self.session,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.active.len()
        )?;
        if let Some(app) = &self.current {
            write!(
                f,
                ", current {} ({} cards left)",
                app.id_and_name(),
                app.cards_remaining()
            )?;
        }
        if self.session.is_farming() {
            write!(f, ", {} games in queue", self.queue_len)?;
        }
        Ok(())
    }
}
