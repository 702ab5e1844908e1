//! IRC codec & session plumbing (C7): line framing, numeric replies,
//! CTCP extraction, PING/PONG.

pub mod codec;
pub mod message;
pub mod numeric;

pub use codec::IrcCodec;
pub use message::Message;

/// The CTCP delimiter, `\x01`, which starts and ends a CTCP payload
/// embedded in a PRIVMSG/NOTICE trailing parameter.
const CTCP_DELIM: char = '\u{1}';

/// Extract a CTCP request from a PRIVMSG payload whose first byte is the
/// CTCP delimiter: `\x01ACTION waves\x01` → `("ACTION", Some("waves"))`.
/// Returns `None` for an ordinary (non-CTCP) payload.
pub fn extract_ctcp(payload: &str) -> Option<(String, Option<String>)> {
    let stripped = payload.strip_prefix(CTCP_DELIM)?;
    let inner = stripped.strip_suffix(CTCP_DELIM).unwrap_or(stripped);
    match inner.split_once(' ') {
        Some((verb, rest)) => Some((verb.to_uppercase(), Some(rest.to_string()))),
        None => Some((inner.to_uppercase(), None)),
    }
}

/// Wrap `verb [args]` back into a CTCP-delimited payload, for replying to
/// CTCP VERSION/PING or sending an ACTION.
pub fn wrap_ctcp(verb: &str, args: Option<&str>) -> String {
    match args {
        Some(args) => format!("{CTCP_DELIM}{verb} {args}{CTCP_DELIM}"),
        None => format!("{CTCP_DELIM}{verb}{CTCP_DELIM}"),
    }
}

/// `PING <token>` → `PONG <token>`.
pub fn pong_for(ping: &Message) -> Message {
    Message::new("PONG", ping.params.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_action_ctcp_with_args() {
        let (verb, args) = extract_ctcp("\u{1}ACTION waves hello\u{1}").unwrap();
        assert_eq!(verb, "ACTION");
        assert_eq!(args.as_deref(), Some("waves hello"));
    }

    #[test]
    fn extracts_version_ctcp_with_no_args() {
        let (verb, args) = extract_ctcp("\u{1}VERSION\u{1}").unwrap();
        assert_eq!(verb, "VERSION");
        assert_eq!(args, None);
    }

    #[test]
    fn plain_privmsg_is_not_ctcp() {
        assert!(extract_ctcp("just chatting").is_none());
    }

    #[test]
    fn wrap_ctcp_round_trips_with_extract() {
        let wrapped = wrap_ctcp("PING", Some("12345"));
        let (verb, args) = extract_ctcp(&wrapped).unwrap();
        assert_eq!(verb, "PING");
        assert_eq!(args.as_deref(), Some("12345"));
    }

    #[test]
    fn pong_mirrors_ping_params() {
        let ping = Message::new("PING", vec!["passerd".into()]);
        let pong = pong_for(&ping);
        assert_eq!(pong.command, "PONG");
        assert_eq!(pong.params, vec!["passerd"]);
    }
}
