//! Callback dispatcher - Drains client events on a dedicated thread

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::chat::{ChatResponder, CHAT_TARGET};
use super::orchestrator::{OrchestratorClosed, OrchestratorHandle};
use super::session::{Command, Session, SessionEvent};
use super::settings::Settings;
use crate::gateway::{ClientEvent, ClientGateway, GatewayError, PersonaState, SteamId};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive failures after which the client is considered gone
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorClosed),
    #[error("event handler panicked")]
    Panicked,
}

/// Why the dispatcher loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherExit {
    Cancelled,
    TooManyFailures,
    OrchestratorGone,
}

/// Running dispatcher thread
pub struct DispatcherHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<DispatcherExit>,
}

impl DispatcherHandle {
    /// Ask the loop to stop after its current iteration
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn join(self) -> DispatcherExit {
        self.cancel();
        self.thread.join().unwrap_or_else(|_| {
            error!("Callback dispatcher thread panicked");
            DispatcherExit::TooManyFailures
        })
    }
}

pub struct CallbackDispatcher<G: ClientGateway> {
    gateway: Arc<G>,
    orchestrator: OrchestratorHandle,
    session: watch::Receiver<Session>,
    settings: Arc<RwLock<Settings>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    responder: ChatResponder,
    cancel: Arc<AtomicBool>,
}

impl<G: ClientGateway> CallbackDispatcher<G> {
    pub fn new(
        gateway: Arc<G>,
        orchestrator: OrchestratorHandle,
        session: watch::Receiver<Session>,
        settings: Arc<RwLock<Settings>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let responder = ChatResponder::new(gateway.steam_id());
        Self {
            gateway,
            orchestrator,
            session,
            settings,
            events,
            responder,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the loop on its own thread
    pub fn spawn(self) -> std::io::Result<DispatcherHandle> {
        let cancel = Arc::clone(&self.cancel);
        let thread = thread::Builder::new()
            .name("callback-dispatcher".to_string())
            .spawn(move || self.run())?;
        Ok(DispatcherHandle { cancel, thread })
    }

    pub fn run(mut self) -> DispatcherExit {
        info!("Callback dispatcher started");
        let mut failures = 0;

        while !self.cancel.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(()) => failures = 0,
                Err(DispatchError::Orchestrator(_)) => {
                    info!("Orchestrator stopped, ending callback dispatcher");
                    return DispatcherExit::OrchestratorGone;
                }
                Err(e) => {
                    failures += 1;
                    error!("Error handling client callbacks ({} in a row): {}", failures, e);
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        error!("Too many callback errors, the client is unreachable");
                        let _ = self.events.send(SessionEvent::PlatformUnreachable);
                        return DispatcherExit::TooManyFailures;
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        }

        info!("Callback dispatcher cancelled");
        DispatcherExit::Cancelled
    }

    /// Handle every drained event. A failing handler does not drop the
    /// events behind it; the first failure is reported once for the poll.
    fn poll_once(&mut self) -> Result<(), DispatchError> {
        let mut failure = None;
        for event in self.gateway.poll_events()? {
            match self.dispatch_guarded(event) {
                Ok(()) => {}
                Err(e @ DispatchError::Orchestrator(_)) => return Err(e),
                Err(e) => {
                    warn!("Client event handler failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn dispatch_guarded(&mut self, event: ClientEvent) -> Result<(), DispatchError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(event)))
            .unwrap_or(Err(DispatchError::Panicked))
    }

    fn dispatch(&mut self, event: ClientEvent) -> Result<(), DispatchError> {
        match event {
            ClientEvent::ChatMessage {
                sender,
                sender_name,
                conversation,
                text,
            } => {
                if sender != self.gateway.steam_id() {
                    info!(target: CHAT_TARGET, "{}: {}", sender_name, text);
                }
                self.auto_reply(sender, conversation, &sender_name);
            }
            ClientEvent::LobbyInvite {
                sender,
                sender_name,
                appid,
            } => {
                if sender != self.gateway.steam_id() {
                    let game = self
                        .gateway
                        .app_name(appid)
                        .unwrap_or_else(|| appid.to_string());
                    info!(target: CHAT_TARGET, "{} sent a lobby invite for {}", sender_name, game);
                }
                self.auto_reply(sender, sender, &sender_name);
            }
            ClientEvent::PersonaChange {
                steam_id,
                status_changed,
            } => {
                if steam_id == self.gateway.steam_id() && status_changed {
                    self.enforce_online()?;
                }
            }
            ClientEvent::ItemAnnouncement { new_items } => {
                self.orchestrator
                    .blocking_send(Command::ItemDropped { new_items })?;
            }
            ClientEvent::AccountInfoUpdated => {
                let persona_name = self.gateway.persona_name();
                info!("Account information updated for {}", persona_name);
                let _ = self
                    .events
                    .send(SessionEvent::AccountUpdated { persona_name });
            }
        }
        Ok(())
    }

    fn auto_reply(&mut self, sender: SteamId, peer: SteamId, sender_name: &str) {
        let settings = self.settings();
        let session = *self.session.borrow();
        let now = Utc::now();

        let Some(reply) = self
            .responder
            .pick_reply(&settings, session, sender, peer, now)
        else {
            return;
        };

        if self.gateway.send_chat_message(peer, &reply) {
            self.responder.record_reply(peer, now);
            info!(target: CHAT_TARGET, "Auto-replied to {} with '{}'", sender_name, reply);
        } else {
            warn!(target: CHAT_TARGET, "Could not reply to {} with '{}'", sender_name, reply);
        }
    }

    fn enforce_online(&self) -> Result<(), DispatchError> {
        if !self.settings().force_online_status {
            return Ok(());
        }
        if self.gateway.persona_state() != PersonaState::Online {
            info!("Persona went offline, forcing online status");
            self.gateway.set_persona_state(PersonaState::Online)?;
        }
        Ok(())
    }

    fn settings(&self) -> Settings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{App, AppId};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const ME: SteamId = SteamId(1);
    const FRIEND: SteamId = SteamId(2);

    /// Gateway answering polls from a script; an exhausted script fails every poll
    #[derive(Default)]
    struct ScriptedGateway {
        polls: Mutex<VecDeque<Result<Vec<ClientEvent>, ()>>>,
        poll_count: Mutex<usize>,
        sent: Mutex<Vec<(SteamId, String)>>,
        state: Mutex<PersonaState>,
        persona_state_fails: AtomicBool,
        persona_name_panics: AtomicBool,
    }

    impl ScriptedGateway {
        fn script(polls: Vec<Result<Vec<ClientEvent>, ()>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                ..Default::default()
            }
        }
    }

    impl ClientGateway for ScriptedGateway {
        fn steam_id(&self) -> SteamId {
            ME
        }

        fn persona_name(&self) -> String {
            if self.persona_name_panics.load(Ordering::Relaxed) {
                panic!("persona lookup failed");
            }
            "Me".to_string()
        }

        fn owned_apps(&self) -> Vec<App> {
            vec![App::new(AppId(730), "Counter-Strike 2")]
        }

        fn poll_events(&self) -> Result<Vec<ClientEvent>, GatewayError> {
            *self.poll_count.lock().unwrap() += 1;
            match self.polls.lock().unwrap().pop_front() {
                Some(Ok(events)) => Ok(events),
                _ => Err(GatewayError::Disconnected),
            }
        }

        fn send_chat_message(&self, to: SteamId, text: &str) -> bool {
            self.sent.lock().unwrap().push((to, text.to_string()));
            true
        }

        fn persona_state(&self) -> PersonaState {
            *self.state.lock().unwrap()
        }

        fn set_persona_state(&self, state: PersonaState) -> Result<(), GatewayError> {
            if self.persona_state_fails.load(Ordering::Relaxed) {
                return Err(GatewayError::Disconnected);
            }
            *self.state.lock().unwrap() = state;
            Ok(())
        }
    }

    struct Harness {
        dispatcher: CallbackDispatcher<ScriptedGateway>,
        gateway: Arc<ScriptedGateway>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _session: watch::Sender<Session>,
    }

    fn harness(gateway: ScriptedGateway, settings: Settings, session: Session) -> Harness {
        let gateway = Arc::new(gateway);
        let (handle, commands) = OrchestratorHandle::detached();
        let (session_tx, session_rx) = watch::channel(session);
        let (events_tx, events) = mpsc::unbounded_channel();
        let dispatcher = CallbackDispatcher::new(
            Arc::clone(&gateway),
            handle,
            session_rx,
            Arc::new(RwLock::new(settings)),
            events_tx,
        );
        Harness {
            dispatcher,
            gateway,
            commands,
            events,
            _session: session_tx,
        }
    }

    fn chat(sender: SteamId, text: &str) -> ClientEvent {
        ClientEvent::ChatMessage {
            sender,
            sender_name: "Friend".to_string(),
            conversation: FRIEND,
            text: text.to_string(),
        }
    }

    #[test]
    fn exits_after_consecutive_failures() {
        let mut h = harness(ScriptedGateway::default(), Settings::default(), Session::None);
        let gateway = Arc::clone(&h.gateway);

        assert_eq!(h.dispatcher.run(), DispatcherExit::TooManyFailures);
        assert_eq!(*gateway.poll_count.lock().unwrap(), 5);
        assert_eq!(h.events.try_recv().unwrap(), SessionEvent::PlatformUnreachable);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let script = vec![Err(()), Err(()), Err(()), Err(()), Ok(Vec::new())];
        let h = harness(ScriptedGateway::script(script), Settings::default(), Session::None);
        let gateway = Arc::clone(&h.gateway);

        assert_eq!(h.dispatcher.run(), DispatcherExit::TooManyFailures);
        assert_eq!(*gateway.poll_count.lock().unwrap(), 10);
    }

    #[test]
    fn cancelled_loop_exits_cleanly() {
        let h = harness(ScriptedGateway::default(), Settings::default(), Session::None);
        h.dispatcher.cancel.store(true, Ordering::Relaxed);
        assert_eq!(h.dispatcher.run(), DispatcherExit::Cancelled);
    }

    #[test]
    fn failed_event_does_not_drop_the_ones_behind_it() {
        let script = vec![Ok(vec![
            ClientEvent::PersonaChange {
                steam_id: ME,
                status_changed: true,
            },
            ClientEvent::ItemAnnouncement { new_items: 1 },
        ])];
        let settings = Settings {
            force_online_status: true,
            ..Default::default()
        };
        let mut h = harness(ScriptedGateway::script(script), settings, Session::Cards);
        *h.gateway.state.lock().unwrap() = PersonaState::Away;
        h.gateway.persona_state_fails.store(true, Ordering::Relaxed);

        assert!(matches!(
            h.dispatcher.poll_once(),
            Err(DispatchError::Gateway(GatewayError::Disconnected))
        ));
        assert!(matches!(
            h.commands.try_recv(),
            Ok(Command::ItemDropped { new_items: 1 })
        ));
    }

    #[test]
    fn panicking_handler_counts_as_a_failure() {
        let script = vec![Ok(vec![
            ClientEvent::AccountInfoUpdated,
            ClientEvent::ItemAnnouncement { new_items: 3 },
        ])];
        let mut h = harness(ScriptedGateway::script(script), Settings::default(), Session::Cards);
        h.gateway.persona_name_panics.store(true, Ordering::Relaxed);

        assert!(matches!(h.dispatcher.poll_once(), Err(DispatchError::Panicked)));
        assert!(matches!(
            h.commands.try_recv(),
            Ok(Command::ItemDropped { new_items: 3 })
        ));
    }

    #[test]
    fn panicked_thread_joins_as_a_failure() {
        let handle = DispatcherHandle {
            cancel: Arc::new(AtomicBool::new(false)),
            thread: thread::spawn(|| -> DispatcherExit { panic!("handler bug") }),
        };
        assert_eq!(handle.join(), DispatcherExit::TooManyFailures);
    }

    #[test]
    fn item_drops_reach_the_orchestrator() {
        let mut h = harness(ScriptedGateway::default(), Settings::default(), Session::Cards);
        h.dispatcher
            .dispatch(ClientEvent::ItemAnnouncement { new_items: 2 })
            .unwrap();
        assert!(matches!(
            h.commands.try_recv(),
            Ok(Command::ItemDropped { new_items: 2 })
        ));
    }

    #[test]
    fn closed_orchestrator_ends_the_loop() {
        let script = vec![Ok(vec![ClientEvent::ItemAnnouncement { new_items: 1 }])];
        let h = harness(ScriptedGateway::script(script), Settings::default(), Session::Cards);
        let Harness {
            dispatcher,
            commands,
            ..
        } = h;
        drop(commands);
        assert_eq!(dispatcher.run(), DispatcherExit::OrchestratorGone);
    }

    #[test]
    fn chat_replies_once_per_wait_window() {
        let settings = Settings {
            enable_chat_response: true,
            chat_responses: vec!["idling, back soon".to_string()],
            ..Default::default()
        };
        let mut h = harness(ScriptedGateway::default(), settings, Session::Idle);

        h.dispatcher.dispatch(chat(FRIEND, "hey")).unwrap();
        h.dispatcher.dispatch(chat(FRIEND, "hello?")).unwrap();
        h.dispatcher.dispatch(chat(ME, "my own message")).unwrap();

        let sent = h.gateway.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(FRIEND, "idling, back soon".to_string())]);
    }

    #[test]
    fn lobby_invites_are_answered() {
        let settings = Settings {
            enable_chat_response: true,
            chat_responses: vec!["busy".to_string()],
            ..Default::default()
        };
        let mut h = harness(ScriptedGateway::default(), settings, Session::Cards);
        h.dispatcher
            .dispatch(ClientEvent::LobbyInvite {
                sender: SteamId(9),
                sender_name: "Stranger".to_string(),
                appid: AppId(730),
            })
            .unwrap();
        assert_eq!(h.gateway.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn forces_online_status_for_own_account() {
        let settings = Settings {
            force_online_status: true,
            ..Default::default()
        };
        let mut h = harness(ScriptedGateway::default(), settings, Session::Idle);
        *h.gateway.state.lock().unwrap() = PersonaState::Away;

        h.dispatcher
            .dispatch(ClientEvent::PersonaChange {
                steam_id: FRIEND,
                status_changed: true,
            })
            .unwrap();
        assert_eq!(h.gateway.persona_state(), PersonaState::Away);

        h.dispatcher
            .dispatch(ClientEvent::PersonaChange {
                steam_id: ME,
                status_changed: true,
            })
            .unwrap();
        assert_eq!(h.gateway.persona_state(), PersonaState::Online);
    }

    #[test]
    fn account_updates_are_published() {
        let mut h = harness(ScriptedGateway::default(), Settings::default(), Session::None);
        h.dispatcher.dispatch(ClientEvent::AccountInfoUpdated).unwrap();
        assert_eq!(
            h.events.try_recv().unwrap(),
            SessionEvent::AccountUpdated {
                persona_name: "Me".to_string()
            }
        );
    }
}
