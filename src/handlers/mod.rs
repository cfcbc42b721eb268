//! Administrative command handlers.
//!
//! This module contains the Handler trait and the command registry that
//! dispatches an already split command line to the matching handler, checks
//! its argument count, and turns the result into a CLI reply.

mod ban;

pub use ban::{BanHandler, BanListHandler, BanStatsHandler, BanUrlHandler};

use crate::ban::BanEngine;
use crate::error::{AdminError, AdminResult, CliStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Trait implemented by all command handlers.
///
/// `args` excludes the command name and has already been checked against the
/// command's argument bounds.
pub trait Handler: Send + Sync {
    /// Handle one command, returning the reply body.
    fn handle(&self, engine: &BanEngine, args: &[&str]) -> AdminResult;
}

/// A command reply: status and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: CliStatus,
    pub body: String,
}

impl Reply {
    pub fn ok(body: String) -> Self {
        Self {
            status: CliStatus::Ok,
            body,
        }
    }
}

impl From<AdminError> for Reply {
    fn from(err: AdminError) -> Self {
        Self {
            status: err.status(),
            body: err.to_string(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.body)
    }
}

/// Split an admin command line into words.
///
/// Words are separated by whitespace. A word starting with `"` runs to the
/// closing quote and may contain whitespace; inside quotes `\"`, `\\`, `\n`
/// and `\t` are unescaped and any other backslash is kept as is, so regex
/// escapes survive quoting.
pub fn split_line(line: &str) -> Result<Vec<String>, AdminError> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(AdminError::UnclosedQuote),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        None => return Err(AdminError::UnclosedQuote),
                        Some('n') => arg.push('\n'),
                        Some('t') => arg.push('\t'),
                        Some(c @ ('"' | '\\')) => arg.push(c),
                        Some(c) => {
                            arg.push('\\');
                            arg.push(c);
                        }
                    },
                    Some(c) => arg.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                arg.push(c);
            }
        }
        args.push(arg);
    }
    Ok(args)
}

struct Command {
    min_args: usize,
    /// `None` for variadic commands.
    max_args: Option<usize>,
    handler: Box<dyn Handler>,
}

/// Registry of command handlers.
pub struct Registry {
    commands: HashMap<&'static str, Command>,
    /// Command usage counters
    command_counts: HashMap<&'static str, AtomicU64>,
}

impl Registry {
    /// Create a new registry with all handlers registered.
    pub fn new() -> Self {
        let mut commands: HashMap<&'static str, Command> = HashMap::new();

        let mut register = |name, min_args, max_args, handler: Box<dyn Handler>| {
            commands.insert(
                name,
                Command {
                    min_args,
                    max_args,
                    handler,
                },
            );
        };
        register("ban", 3, None, Box::new(BanHandler));
        register("ban.url", 1, Some(1), Box::new(BanUrlHandler));
        register("ban.list", 0, Some(0), Box::new(BanListHandler));
        register("ban.stats", 0, Some(0), Box::new(BanStatsHandler));

        let command_counts = commands.keys().map(|&cmd| (cmd, AtomicU64::new(0))).collect();

        Self {
            commands,
            command_counts,
        }
    }

    /// Command usage statistics, most used first.
    pub fn get_command_stats(&self) -> Vec<(&'static str, u64)> {
        let mut stats: Vec<_> = self
            .command_counts
            .iter()
            .map(|(cmd, count)| (*cmd, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        stats.sort_by(|a, b| b.1.cmp(&a.1));
        stats
    }

    /// Run `argv` (command name first) against `engine`.
    pub fn dispatch(&self, engine: &BanEngine, argv: &[&str]) -> Reply {
        let Some((&name, args)) = argv.split_first() else {
            return Reply::ok(String::new());
        };
        match self.execute(engine, name, args) {
            Ok(body) => {
                debug!(command = name, "Admin command succeeded");
                Reply::ok(body)
            }
            Err(e) => {
                warn!(command = name, error_code = e.error_code(), error = %e, "Admin command failed");
                e.into()
            }
        }
    }

    fn execute(&self, engine: &BanEngine, name: &str, args: &[&str]) -> AdminResult {
        let Some((&key, command)) = self.commands.get_key_value(name) else {
            return Err(AdminError::UnknownCommand(name.to_string()));
        };
        if let Some(count) = self.command_counts.get(key) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        if args.len() < command.min_args {
            return Err(AdminError::TooFew);
        }
        if command.max_args.is_some_and(|max| args.len() > max) {
            return Err(AdminError::TooMany);
        }
        command.handler.handle(engine, args)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
