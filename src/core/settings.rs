//! Application settings management

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use super::app::AppId;

/// The platform refuses to count playtime for more games than this at once
pub const MAX_CONCURRENT_APPS: usize = 32;

/// Cookies of a logged-in community web session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSession {
    /// `sessionid` cookie
    #[serde(default)]
    pub session_id: String,
    /// `steamLoginSecure` cookie, prefixed with the account's 64-bit id
    #[serde(default)]
    pub steam_login_secure: String,
    /// `steamparental` cookie for family-view accounts
    #[serde(default)]
    pub steam_parental: Option<String>,
}

impl WebSession {
    pub fn is_logged_in(&self) -> bool {
        !self.session_id.trim().is_empty() && !self.steam_login_secure.trim().is_empty()
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Web session
    /// Cookies used for profile scraping
    pub web_session: WebSession,

    // Card farming
    /// Games never farmed for cards
    pub blacklisted_card_games: BTreeSet<AppId>,
    /// Farm the games with the most valuable cards first
    pub idle_cards_with_most_value: bool,
    /// Only farm games that already have enough playtime for drops
    pub only_idle_games_with_certain_minutes: bool,
    /// Playtime threshold in minutes
    pub min_playtime_minutes: u32,
    /// Games idled together while no game meets the playtime threshold
    pub batch_size: usize,
    /// Upper bound on simultaneously idled games
    pub max_concurrent_apps: usize,

    // Restarts
    /// Periodically bounce idle processes
    pub restart_games: bool,
    /// Base restart interval in minutes
    pub restart_games_minutes: u32,
    /// Restart one random game instead of all of them
    pub restart_games_at_random: bool,

    // Timers
    /// Card progress check interval in minutes
    pub progress_check_minutes: u32,
    /// Badge refresh interval while batch idling, in minutes
    pub batch_check_minutes: u32,
    /// Liveness check interval in seconds
    pub process_check_secs: u32,

    // Chat
    /// Auto-reply to chat messages and lobby invites
    pub enable_chat_response: bool,
    /// Replies picked at random
    pub chat_responses: Vec<String>,
    /// Only reply while a session is running
    pub only_reply_if_idling: bool,
    /// Rate-limit replies per peer
    pub wait_between_replies: bool,
    /// Minimum minutes between two replies to the same peer
    pub wait_between_replies_minutes: u32,
    /// Put the persona back online when it drifts away
    pub force_online_status: bool,

    // History
    /// Remember the last idle selection
    pub save_app_idle_history: bool,
    /// Last idle selection
    pub game_history_ids: Vec<AppId>,
    /// Idle hidden placeholder games on exit to push real games out of "recently played"
    pub clear_recently_played_on_exit: bool,

    // Advanced
    /// Custom idle executable
    pub idle_executable: Option<PathBuf>,
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            web_session: WebSession::default(),

            blacklisted_card_games: BTreeSet::new(),
            idle_cards_with_most_value: false,
            only_idle_games_with_certain_minutes: false,
            min_playtime_minutes: 120,
            batch_size: 30,
            max_concurrent_apps: MAX_CONCURRENT_APPS,

            restart_games: true,
            restart_games_minutes: 60,
            restart_games_at_random: false,

            progress_check_minutes: 10,
            batch_check_minutes: 30,
            process_check_secs: 30,

            enable_chat_response: false,
            chat_responses: vec![
                "I'm idling right now, I'll get back to you later.".to_string(),
                "Busy farming cards, talk soon!".to_string(),
            ],
            only_reply_if_idling: true,
            wait_between_replies: true,
            wait_between_replies_minutes: 5,
            force_online_status: false,

            save_app_idle_history: true,
            game_history_ids: Vec::new(),
            clear_recently_played_on_exit: false,

            idle_executable: None,
            data_directory: None,
            debug_logging: false,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("CardBoost")
        })
    }

    /// Directory receiving raw responses that failed to parse
    pub fn get_diagnostics_directory(&self) -> PathBuf {
        self.get_data_directory().join("diagnostics")
    }

    /// Get the database file path
    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("cardboost.db")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.max_concurrent_apps = self.max_concurrent_apps.clamp(1, MAX_CONCURRENT_APPS);
        self.batch_size = self.batch_size.clamp(1, self.max_concurrent_apps);
        self.restart_games_minutes = self.restart_games_minutes.max(1);
        self.progress_check_minutes = self.progress_check_minutes.max(1);
        self.batch_check_minutes = self.batch_check_minutes.max(1);
        self.process_check_secs = self.process_check_secs.max(5);
        self.chat_responses.retain(|r| !r.trim().is_empty());
    }

    /// Minimum playtime gate, if enabled
    pub fn playtime_gate(&self) -> Option<f64> {
        self.only_idle_games_with_certain_minutes
            .then_some(self.min_playtime_minutes as f64)
    }

    pub fn is_blacklisted(&self, appid: AppId) -> bool {
        self.blacklisted_card_games.contains(&appid)
    }
}
