//! Community gateway - Identity and library from the web profile, events from a bridge
//!
//! Account details are read from the community profile once at connect time.
//! Live notifications and outgoing requests travel over a pair of bounded
//! queues; whatever native client binding is attached sits on the other end
//! of the [`ClientBridge`].

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Mutex, RwLock};

use regex::Regex;
use tracing::{debug, info, warn};

use super::{ClientEvent, ClientGateway, GatewayError, PersonaState, SteamId};
use crate::core::settings::WebSession;
use crate::core::{App, AppId};
use crate::web::{self, PageFetcher, ScrapeError};

/// Capacity of each bridge queue
const BRIDGE_CAPACITY: usize = 256;

/// Requests the engine makes of the native client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Chat { to: SteamId, text: String },
    SetPersonaState(PersonaState),
}

/// Native-client side of the gateway queues
pub struct ClientBridge {
    pub events: SyncSender<ClientEvent>,
    pub requests: Receiver<ClientRequest>,
}

pub struct CommunityGateway {
    steam_id: SteamId,
    persona_name: String,
    owned: Vec<App>,
    persona_state: RwLock<PersonaState>,
    events: Mutex<Receiver<ClientEvent>>,
    requests: SyncSender<ClientRequest>,
}

impl CommunityGateway {
    /// Resolve the account behind `session` and load its library
    pub async fn connect<F: PageFetcher>(
        fetcher: &F,
        session: &WebSession,
    ) -> Result<(Self, ClientBridge), GatewayError> {
        if !session.is_logged_in() {
            return Err(GatewayError::NotLoggedIn);
        }
        let steam_id =
            steam_id_from_cookie(&session.steam_login_secure).ok_or(GatewayError::InvalidSession)?;
        let profile = web::profile_url(steam_id.0);

        let profile_xml = fetcher.fetch(&format!("{}/?xml=1", profile)).await?;
        let persona_name = cdata_tag(&profile_xml, "steamID").unwrap_or_else(|| {
            warn!("Profile has no persona name, using the account id");
            steam_id.to_string()
        });

        let games_xml = fetcher
            .fetch(&format!("{}/games/?tab=all&xml=1", profile))
            .await?;
        let owned = parse_owned_games(&games_xml)?;
        info!(
            "Connected as {} ({}) with {} owned games",
            persona_name,
            steam_id,
            owned.len()
        );

        let (event_tx, event_rx) = mpsc::sync_channel(BRIDGE_CAPACITY);
        let (request_tx, request_rx) = mpsc::sync_channel(BRIDGE_CAPACITY);

        let gateway = Self {
            steam_id,
            persona_name,
            owned,
            persona_state: RwLock::new(PersonaState::Online),
            events: Mutex::new(event_rx),
            requests: request_tx,
        };
        let bridge = ClientBridge {
            events: event_tx,
            requests: request_rx,
        };
        Ok((gateway, bridge))
    }

    fn request(&self, request: ClientRequest) -> bool {
        match self.requests.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Client request queue is full");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("No client attached to take requests");
                false
            }
        }
    }
}

impl ClientGateway for CommunityGateway {
    fn steam_id(&self) -> SteamId {
        self.steam_id
    }

    fn persona_name(&self) -> String {
        self.persona_name.clone()
    }

    fn owned_apps(&self) -> Vec<App> {
        self.owned.clone()
    }

    fn app_name(&self, appid: AppId) -> Option<String> {
        self.owned
            .iter()
            .find(|app| app.appid == appid)
            .map(|app| app.name.clone())
    }

    fn poll_events(&self) -> Result<Vec<ClientEvent>, GatewayError> {
        let events = self.events.lock().map_err(|_| GatewayError::Disconnected)?;
        let mut drained = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => drained.push(event),
                Err(TryRecvError::Empty) => return Ok(drained),
                Err(TryRecvError::Disconnected) => {
                    // Deliver what arrived before the client went away
                    if drained.is_empty() {
                        return Err(GatewayError::Disconnected);
                    }
                    return Ok(drained);
                }
            }
        }
    }

    fn send_chat_message(&self, to: SteamId, text: &str) -> bool {
        self.request(ClientRequest::Chat {
            to,
            text: text.to_string(),
        })
    }

    fn persona_state(&self) -> PersonaState {
        self.persona_state
            .read()
            .map(|state| *state)
            .unwrap_or_default()
    }

    fn set_persona_state(&self, state: PersonaState) -> Result<(), GatewayError> {
        if !self.request(ClientRequest::SetPersonaState(state)) {
            return Err(GatewayError::Disconnected);
        }
        if let Ok(mut current) = self.persona_state.write() {
            *current = state;
        }
        Ok(())
    }
}

/// The account id is the cookie's prefix, before the `||` separator
pub fn steam_id_from_cookie(steam_login_secure: &str) -> Option<SteamId> {
    let value = steam_login_secure.trim();
    let end = value
        .find("%7C%7C")
        .or_else(|| value.find("||"))
        .unwrap_or(value.len());
    value[..end].parse::<u64>().ok().map(SteamId)
}

fn cdata_tag(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{tag}>\s*(?:<!\[CDATA\[(.*?)\]\]>|([^<]*))\s*</{tag}>");
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(xml)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Owned games from the profile's XML game list
fn parse_owned_games(xml: &str) -> Result<Vec<App>, GatewayError> {
    if !xml.contains("<gamesList") {
        return Err(ScrapeError::Unparseable("owned games list").into());
    }

    let game = Regex::new(r"(?s)<game>(.*?)</game>")
        .map_err(|_| ScrapeError::Unparseable("owned games list"))?;

    let mut apps = Vec::new();
    for caps in game.captures_iter(xml) {
        let Some(body) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let Some(appid) = cdata_tag(body, "appID").and_then(|id| id.parse::<AppId>().ok()) else {
            continue;
        };
        let name = cdata_tag(body, "name").unwrap_or_else(|| appid.to_string());
        apps.push(App::new(appid, name));
    }
    Ok(apps)
}
