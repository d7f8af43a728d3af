//! CardBoost - Idle your game library and farm trading-card drops
//!
//! A headless front-end over the session orchestrator: it connects to the
//! platform with the saved web session, starts the requested session, and
//! then serves console commands until the session ends or the user quits.

#![allow(dead_code)] // Parts of the engine API are only exercised by tests

mod cli;
mod core;
mod gateway;
mod persistence;
mod web;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use single_instance::SingleInstance;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, CliCommand, ConsoleCommand};
use crate::core::settings::WebSession;
use crate::core::{
    catalog, App, AppId, BadgeCatalog, CallbackDispatcher, Command, DispatcherExit, Orchestrator,
    OrchestratorHandle, ProcessSupervisor, SessionEvent,
};
use crate::gateway::{ClientGateway, CommunityGateway};
use crate::persistence::Database;
use crate::web::WebClient;

/// Application name constant
pub const APP_NAME: &str = "CardBoost";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let action = Cli::parse().command;

    // Initialize database
    let db = Database::open_default()?;
    db.initialize()?;
    let mut settings = db.load_settings()?.unwrap_or_default();
    settings.validate();

    // Initialize logging
    init_logging(settings.debug_logging);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    if let CliCommand::Login {
        session_id,
        steam_login_secure,
        steam_parental,
    } = action
    {
        settings.web_session = WebSession {
            session_id,
            steam_login_secure,
            steam_parental,
        };
        db.save_settings(&settings)?;
        println!("Web session saved.");
        return Ok(());
    }

    // Ensure only one instance of CardBoost itself is running
    let instance = SingleInstance::new(APP_NAME).expect("Failed to create single instance lock");
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        eprintln!("{} is already running!", APP_NAME);
        return Ok(());
    }

    if !settings.web_session.is_logged_in() {
        bail!("No web session saved. Run 'cardboost login <sessionid> <steamLoginSecure>' first.");
    }

    let client = WebClient::new(&settings.web_session).context("Failed to build the web client")?;
    let (gateway, bridge) = CommunityGateway::connect(&client, &settings.web_session)
        .await
        .context("Failed to connect to the platform")?;
    let gateway = Arc::new(gateway);
    info!("Logged in as {}", gateway.persona_name());

    if let CliCommand::Games { query } = &action {
        let query = CliCommand::games_query(query);
        list_games(gateway.owned_apps(), query.as_deref());
        return Ok(());
    }

    let mut names = catalog::load_app_names(&db, &client, Utc::now()).await?;
    for app in gateway.owned_apps() {
        names.insert(app.appid, app.name);
    }
    let names = Arc::new(names);

    let badges = BadgeCatalog::new(
        client.clone(),
        web::profile_url(gateway.steam_id().0),
        Arc::clone(&names),
        settings.get_diagnostics_directory(),
    )
    .context("Failed to compile page patterns")?;

    let executable = settings
        .idle_executable
        .clone()
        .unwrap_or_else(ProcessSupervisor::default_executable);
    info!("Using idle executable {:?}", executable);

    let history = settings.game_history_ids.clone();
    let settings = Arc::new(RwLock::new(settings));
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let (orchestrator, handle, session) = Orchestrator::new(
        ProcessSupervisor::new(executable),
        Arc::new(badges),
        Arc::clone(&settings),
        events_tx.clone(),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run());

    let dispatcher = CallbackDispatcher::new(
        Arc::clone(&gateway),
        handle.clone(),
        session,
        Arc::clone(&settings),
        events_tx,
    )
    .spawn()
    .context("Failed to start the callback dispatcher")?;

    match action {
        CliCommand::Cards => handle.send(Command::StartCards).await?,
        CliCommand::Idle { appids: ids } => {
            let ids = if ids.is_empty() { history } else { ids };
            if ids.is_empty() {
                warn!("No games given and no idle history, nothing to do");
            }
            handle
                .send(Command::StartIdle(apps_for(&ids, &names)))
                .await?;
        }
        _ => {}
    }

    let outcome = console_loop(&handle, &mut events, &names).await;

    info!("{} shutting down", APP_NAME);
    if handle.send(Command::Shutdown).await.is_ok() {
        if let Err(e) = orchestrator_task.await {
            error!("Orchestrator task failed: {}", e);
        }
    }
    let exit = tokio::task::spawn_blocking(move || dispatcher.join()).await?;
    if exit == DispatcherExit::TooManyFailures {
        warn!("Callback dispatcher gave up on the client");
    }
    drop(bridge);

    match settings.read() {
        Ok(settings) => db.save_settings(&settings)?,
        Err(e) => error!("Settings lock poisoned, not saving: {}", e),
    }

    outcome
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug { "cardboost=debug" } else { "cardboost=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Serve console commands and session events until the session is over
async fn console_loop(
    handle: &OrchestratorHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    names: &HashMap<AppId, String>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(SessionEvent::PlatformUnreachable) => {
                    bail!("The platform client is unreachable. Restart {} once it is running again.", APP_NAME);
                }
                Some(event) => {
                    if !report_event(&event) {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let command = match cli::parse_console_line(&line) {
                        Some(ConsoleCommand::Quit) => return Ok(()),
                        Some(ConsoleCommand::Status) => {
                            println!("{}", handle.status().await?);
                            continue;
                        }
                        Some(ConsoleCommand::Next) => Command::SkipCurrent,
                        Some(ConsoleCommand::Blacklist) => Command::BlacklistCurrent,
                        Some(ConsoleCommand::Check) => Command::CheckCurrentBadge,
                        Some(ConsoleCommand::Stop) => Command::Stop,
                        Some(ConsoleCommand::Cards) => Command::StartCards,
                        Some(ConsoleCommand::Idle(ids)) => Command::StartIdle(apps_for(&ids, names)),
                        None => {
                            println!("Unknown command: {}", line.trim());
                            cli::print_console_help();
                            continue;
                        }
                    };
                    handle.send(command).await?;
                }
                Ok(None) => {
                    info!("Console input closed, press Ctrl-C to exit");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    stdin_open = false;
                }
            },
        }
    }
}

/// Print a session event. Returns `false` when there is nothing left to run.
fn report_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Started { session, apps } => {
            let names: Vec<String> = apps.iter().map(App::display_name).collect();
            println!("{}: {}", session, names.join(", "));
        }
        SessionEvent::Stopped(report) => {
            println!("Stopped {} process(es)", report.attempted);
            if report.errors > 0 {
                println!("{} process(es) could not be stopped", report.errors);
            }
        }
        SessionEvent::QueueLoaded { games, cards } => {
            println!("{} card drops left across {} games", cards, games);
        }
        SessionEvent::CardsRemaining { app } => {
            println!("{}: {} cards left", app.display_name(), app.cards_remaining());
        }
        SessionEvent::FarmingComplete => {
            println!("All card drops collected.");
            return false;
        }
        SessionEvent::BadgesUnavailable(reason) => {
            println!("Could not read badges ({}). Log in again with 'cardboost login'.", reason);
            return false;
        }
        SessionEvent::AppRestarted(appid) => {
            println!("Restarted app {}", appid);
        }
        SessionEvent::AccountUpdated { persona_name } => {
            println!("Account updated: {}", persona_name);
        }
        SessionEvent::PlatformUnreachable => return false,
    }
    true
}

fn apps_for(ids: &[AppId], names: &HashMap<AppId, String>) -> Vec<App> {
    ids.iter()
        .map(|id| App::new(*id, names.get(id).cloned().unwrap_or_default()))
        .collect()
}

fn list_games(mut apps: Vec<App>, query: Option<&str>) {
    apps.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    let query = query.map(str::to_lowercase);
    let mut shown = 0;
    for app in apps {
        if let Some(q) = &query {
            if !app.name.to_lowercase().contains(q.as_str()) {
                continue;
            }
        }
        println!("{:>8}  {}", app.appid, app.name);
        shown += 1;
    }
    println!("{} game(s)", shown);
}
