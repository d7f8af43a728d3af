//! Client gateway - The platform client seen as an opaque capability

pub mod community;

use serde::{Deserialize, Serialize};

use crate::core::{App, AppId};
use crate::web::ScrapeError;

pub use community::{ClientBridge, ClientRequest, CommunityGateway};

/// 64-bit account identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SteamId(pub u64);

impl std::fmt::Display for SteamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Online status shown to friends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonaState {
    Offline,
    #[default]
    Online,
    Busy,
    Away,
    Snooze,
    LookingToTrade,
    LookingToPlay,
    Invisible,
}

/// Asynchronous notifications raised by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatMessage {
        sender: SteamId,
        sender_name: String,
        /// Conversation the message belongs to; replies go here
        conversation: SteamId,
        text: String,
    },
    PersonaChange {
        steam_id: SteamId,
        status_changed: bool,
    },
    LobbyInvite {
        sender: SteamId,
        sender_name: String,
        appid: AppId,
    },
    ItemAnnouncement {
        new_items: u32,
    },
    AccountInfoUpdated,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no logged-in web session")]
    NotLoggedIn,
    #[error("web session cookie does not carry an account id")]
    InvalidSession,
    #[error("profile could not be loaded: {0}")]
    Profile(#[from] ScrapeError),
    #[error("client connection lost")]
    Disconnected,
}

/// Capabilities of the platform client used by the engine
pub trait ClientGateway: Send + Sync + 'static {
    fn steam_id(&self) -> SteamId;

    fn persona_name(&self) -> String;

    /// Games in the account's library
    fn owned_apps(&self) -> Vec<App>;

    /// Name of an owned game
    fn app_name(&self, appid: AppId) -> Option<String> {
        self.owned_apps()
            .into_iter()
            .find(|app| app.appid == appid)
            .map(|app| app.name)
    }

    /// Drain every queued event without blocking
    fn poll_events(&self) -> Result<Vec<ClientEvent>, GatewayError>;

    /// Returns `false` when the message could not be sent
    fn send_chat_message(&self, to: SteamId, text: &str) -> bool;

    fn persona_state(&self) -> PersonaState;

    fn set_persona_state(&self, state: PersonaState) -> Result<(), GatewayError>;
}
