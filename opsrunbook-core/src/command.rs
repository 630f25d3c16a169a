/// Inline `/copilot` command parsing for PR comments and reviews
use serde::{Deserialize, Serialize};
use std::fmt;

pub const COMMAND_PREFIX: &str = "/copilot";

/// A review-cycle control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCommand {
    /// Pause automated review cycles on the PR
    Stop,
    /// Resume automated review cycles on the PR
    Resume,
}

impl fmt::Display for ReviewCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewCommand::Stop => write!(f, "stop"),
            ReviewCommand::Resume => write!(f, "resume"),
        }
    }
}

/// Result of parsing a comment for `/copilot` commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// No line starts with `/copilot`
    NoCommand,
    /// A `/copilot` line was found but the command was not recognized
    UnrecognizedCommand {
        /// The unrecognized command text that was attempted
        attempted: String,
    },
    /// A valid command was found
    Command(ReviewCommand),
}

/// Parse a comment body for `/copilot` commands
///
/// The prefix must start a line (after trimming), and is matched
/// case-insensitively, as is the command word.
///
/// # First Line Wins
///
/// The parser stops at the **first** line that starts with `/copilot`, even
/// when that line is incomplete or unrecognized, so a comment with several
/// command lines can never be read two ways.
pub fn parse_comment(body: &str) -> ParseResult {
    for line in body.lines() {
        let trimmed = line.trim();

        // Safe prefix extraction: slicing a non-ASCII line at a fixed byte
        // offset could otherwise panic
        let Some(prefix) = trimmed.get(..COMMAND_PREFIX.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(COMMAND_PREFIX) {
            continue;
        }

        let rest = &trimmed[COMMAND_PREFIX.len()..];

        if rest.is_empty() {
            return ParseResult::UnrecognizedCommand {
                attempted: String::new(),
            };
        }

        // "/copilotstop" is not a command line
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }

        let command_word = rest.split_whitespace().next().unwrap_or("");

        if command_word.eq_ignore_ascii_case("stop") {
            return ParseResult::Command(ReviewCommand::Stop);
        } else if command_word.eq_ignore_ascii_case("resume") {
            return ParseResult::Command(ReviewCommand::Resume);
        } else {
            return ParseResult::UnrecognizedCommand {
                attempted: command_word.to_string(),
            };
        }
    }

    ParseResult::NoCommand
}

/// The recognized command in `body`, if any.
pub fn parse_command(body: &str) -> Option<ReviewCommand> {
    match parse_comment(body) {
        ParseResult::Command(command) => Some(command),
        _ => None,
    }
}
