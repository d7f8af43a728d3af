//! Command-line front-end - Arguments and interactive console commands

use clap::{Parser, Subcommand};

use crate::core::AppId;

const CONSOLE_HELP: &str = "\
While running:
    next        Skip the current game
    blacklist   Never farm the current game again
    check       Re-check the current game's card drops
    status      Show the session status
    cards       Switch to card farming
    idle ID...  Switch to idling the given games
    stop        Stop the session
    quit        Stop and exit";

#[derive(Debug, Parser)]
#[command(
    name = "cardboost",
    version,
    about = "Idle your game library and farm trading-card drops",
    after_help = CONSOLE_HELP
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

/// What the process was started to do
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Farm trading cards until no drops are left
    Cards,
    /// Idle games (defaults to the last idled set)
    Idle {
        appids: Vec<AppId>,
    },
    /// List owned games, optionally filtered by name
    Games {
        query: Vec<String>,
    },
    /// Save the community web session cookies
    Login {
        session_id: String,
        steam_login_secure: String,
        steam_parental: Option<String>,
    },
}

impl CliCommand {
    /// Name filter of a `games` listing
    pub fn games_query(query: &[String]) -> Option<String> {
        let query = query.join(" ");
        (!query.trim().is_empty()).then_some(query)
    }
}

/// Commands typed while a session runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Next,
    Blacklist,
    Check,
    Status,
    Stop,
    Cards,
    Idle(Vec<AppId>),
    Quit,
}

/// Parse one console line. `None` for blank lines and unknown commands.
pub fn parse_console_line(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()?.to_ascii_lowercase().as_str() {
        "next" | "skip" => ConsoleCommand::Next,
        "blacklist" => ConsoleCommand::Blacklist,
        "check" => ConsoleCommand::Check,
        "status" => ConsoleCommand::Status,
        "stop" => ConsoleCommand::Stop,
        "cards" => ConsoleCommand::Cards,
        "idle" => {
            let ids = words
                .map(str::parse::<AppId>)
                .collect::<Result<Vec<_>, _>>()
                .ok()?;
            ConsoleCommand::Idle(ids)
        }
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => return None,
    };
    Some(command)
}

pub fn print_console_help() {
    println!("{}", CONSOLE_HELP);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliCommand, clap::Error> {
        Cli::try_parse_from(std::iter::once("cardboost").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    #[test]
    fn parses_subcommands() {
        assert_eq!(parse(&["cards"]).unwrap(), CliCommand::Cards);
        assert_eq!(
            parse(&["idle", "730", "440"]).unwrap(),
            CliCommand::Idle {
                appids: vec![AppId(730), AppId(440)]
            }
        );
        assert_eq!(parse(&["idle"]).unwrap(), CliCommand::Idle { appids: vec![] });
        assert_eq!(
            parse(&["login", "sid", "secure"]).unwrap(),
            CliCommand::Login {
                session_id: "sid".to_string(),
                steam_login_secure: "secure".to_string(),
                steam_parental: None,
            }
        );
    }

    #[test]
    fn joins_the_games_query() {
        let CliCommand::Games { query } = parse(&["games", "team", "fortress"]).unwrap() else {
            panic!("expected a games listing");
        };
        assert_eq!(
            CliCommand::games_query(&query).as_deref(),
            Some("team fortress")
        );
        assert_eq!(CliCommand::games_query(&[]), None);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["idle", "abc"]).is_err());
        assert!(parse(&["login", "only-one"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[test]
    fn parses_console_lines() {
        assert_eq!(parse_console_line("  next "), Some(ConsoleCommand::Next));
        assert_eq!(parse_console_line("STATUS"), Some(ConsoleCommand::Status));
        assert_eq!(
            parse_console_line("idle 10 20"),
            Some(ConsoleCommand::Idle(vec![AppId(10), AppId(20)]))
        );
        assert_eq!(parse_console_line("idle ten"), None);
        assert_eq!(parse_console_line(""), None);
        assert_eq!(parse_console_line("dance"), None);
    }
}
