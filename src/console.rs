//! Operator console.
//!
//! Reads one command per prompt from stdin, independent of client traffic,
//! and issues registry queries and mutations. Protocol output (prompt,
//! tables, confirmations) goes to stdout; diagnostics go through tracing.

use crate::registry::Registry;
use crate::session::timestamp;
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

/// Console prompt.
pub const PROMPT: &str = "Enter(h for help): ";

const HELP_TEXT: &str = "\
The commands:
----------------------------------------------------
q\t\tquery current connections
d id\t\tdisconnect client
x\t\tquit server
h\t\thelp";

const TABLE_HEADER: &str = "\
The current connections:
Id.\t\t\tClient\t\t\t\tLogonTime
-----------------------------------------------------";

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `q`: print the current connection table.
    Query,
    /// `d <id>`: force-disconnect one session.
    Disconnect(u64),
    /// `x`: shut the server down.
    Quit,
    /// `h`: print the command summary.
    Help,
    /// Anything else.
    Unrecognized(String),
}

impl Command {
    /// Parse one console input line.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed {
            "q" => Command::Query,
            "x" => Command::Quit,
            "h" => Command::Help,
            _ => {
                if let Some(rest) = trimmed.strip_prefix("d ") {
                    if let Ok(id) = rest.trim().parse::<u64>() {
                        return Command::Disconnect(id);
                    }
                }
                Command::Unrecognized(trimmed.to_string())
            }
        }
    }
}

/// Run the console loop until `x` or stdin EOF.
///
/// `x` fires the shutdown signal; every other command (and every error)
/// leaves the server running and reprompts.
pub async fn run(registry: Arc<Registry>, shutdown: watch::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{PROMPT}");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed, server keeps running");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Console read error");
                return;
            }
        };

        match Command::parse(&line) {
            Command::Query => print_connections(&registry),
            Command::Disconnect(id) => disconnect(&registry, id),
            Command::Help => println!("{HELP_TEXT}"),
            Command::Quit => {
                let _ = shutdown.send(());
                return;
            }
            Command::Unrecognized(text) => {
                println!(
                    "{} - Unrecognized command '{}'. Type h for help.",
                    timestamp(),
                    text
                );
            }
        }
    }
}

/// Print the connection table, ascending by id.
fn print_connections(registry: &Registry) {
    println!("{TABLE_HEADER}");
    for info in registry.list() {
        println!(
            "{}\t\t\t{}\t\t{}",
            info.id,
            info.peer,
            info.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Disconnect one session by id, reporting the outcome.
fn disconnect(registry: &Registry, id: u64) {
    match registry.disconnect(id) {
        Some(info) => println!(
            "{} - The connection '{}' has been disconnected.",
            timestamp(),
            info.peer
        ),
        None => println!(
            "{} - No connection with id '{}' was found.",
            timestamp(),
            id
        ),
    }
}
