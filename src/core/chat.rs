//! Chat auto-responder - Canned replies while the account is idling

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;

use super::session::Session;
use super::settings::Settings;
use crate::gateway::SteamId;

/// Log target for chat traffic
pub const CHAT_TARGET: &str = "cardboost::chat";

/// Remembers when each peer was last answered
#[derive(Debug)]
pub struct ChatResponder {
    own_id: SteamId,
    last_reply: HashMap<SteamId, DateTime<Utc>>,
}

impl ChatResponder {
    pub fn new(own_id: SteamId) -> Self {
        Self {
            own_id,
            last_reply: HashMap::new(),
        }
    }

    /// Pick a reply for `peer`, or `None` when the settings say to stay quiet
    pub fn pick_reply(
        &self,
        settings: &Settings,
        session: Session,
        sender: SteamId,
        peer: SteamId,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if !settings.enable_chat_response || sender == self.own_id {
            return None;
        }
        if settings.only_reply_if_idling && !session.is_running() {
            return None;
        }
        if settings.wait_between_replies {
            if let Some(last) = self.last_reply.get(&peer) {
                let waited = now.signed_duration_since(*last).num_minutes();
                if waited < i64::from(settings.wait_between_replies_minutes) {
                    return None;
                }
            }
        }
        settings.chat_responses.choose(&mut rand::rng()).cloned()
    }

    /// Record a reply that was actually delivered
    pub fn record_reply(&mut self, peer: SteamId, at: DateTime<Utc>) {
        self.last_reply.insert(peer, at);
    }
}
