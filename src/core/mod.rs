//! Core module - Session orchestration, process supervision, and card farming

pub mod app;
pub mod badges;
pub mod catalog;
pub mod chat;
pub mod dispatcher;
pub mod orchestrator;
pub mod process;
pub mod session;
pub mod settings;
pub mod timers;

pub use app::{App, AppId, TradeCard};
pub use badges::{BadgeCatalog, BadgeSource};
pub use dispatcher::{CallbackDispatcher, DispatcherExit, DispatcherHandle};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use process::{ProcessSupervisor, Supervisor};
pub use session::{Command, Session, SessionEvent, StatusSnapshot, StopReport};
pub use settings::Settings;
