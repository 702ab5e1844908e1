//! A parsed IRC line: optional prefix, command, and parameters.
//!
//! Deliberately narrower than a full IRCv3 message type (no tags, no
//! per-command enum) — this crate only ever speaks the RFC-1459 subset
//! `spec.md` §6 lists, so a command is kept as a plain string and
//! dispatched by the session's own match, not by the protocol layer.

use std::fmt;

/// One IRC protocol line, already split into its grammar parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    pub fn with_prefix(prefix: impl Into<String>, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// The last parameter, if this message has one — the common case for
    /// reading a PRIVMSG/NOTICE payload.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Parse one already-unframed line (no trailing CR/LF) into a message.
    /// Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line;
        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, r) = stripped.split_once(' ').unwrap_or((stripped, ""));
            prefix = Some(p.to_string());
            rest = r.trim_start();
        }
        if rest.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((word, remainder)) => {
                    params.push(word.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        let command = params.remove(0);
        Some(Self { prefix, command: command.to_uppercase(), params })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        if let Some((last, rest)) = self.params.split_last() {
            for p in rest {
                write!(f, " {p}")?;
            }
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_command_and_trailing() {
        let m = Message::parse(":alice!a@host PRIVMSG #twitter :hello there").unwrap();
        assert_eq!(m.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.params, vec!["#twitter", "hello there"]);
    }

    #[test]
    fn parses_command_with_no_params() {
        let m = Message::parse("PING").unwrap();
        assert_eq!(m.command, "PING");
        assert!(m.params.is_empty());
    }

    #[test]
    fn blank_line_is_none() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("   ").is_none());
    }

    #[test]
    fn display_round_trips_with_trailing_colon_when_needed() {
        let m = Message::with_prefix("passerd", "PRIVMSG", vec!["#twitter".into(), "hello there".into()]);
        assert_eq!(m.to_string(), ":passerd PRIVMSG #twitter :hello there");

        let m2 = Message::new("NICK", vec!["alice".into()]);
        assert_eq!(m2.to_string(), "NICK alice");
    }
}
