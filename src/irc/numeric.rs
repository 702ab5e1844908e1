//! Numeric reply constants and the reply-builder helper.
//!
//! `spec.md` §6 pins the minimum set of numerics this crate emits.
//! Builders always place the session's current nick as the first
//! argument, per RFC-1459 convention.

use super::message::Message;

pub const RPL_WELCOME: u16 = 1;
pub const RPL_YOURHOST: u16 = 2;
pub const RPL_CREATED: u16 = 3;
pub const RPL_MYINFO: u16 = 4;
pub const RPL_CHANNELMODEIS: u16 = 324;
pub const RPL_TOPIC: u16 = 332;
pub const RPL_WHOREPLY: u16 = 352;
pub const RPL_ENDOFWHO: u16 = 315;
pub const RPL_WHOISUSER: u16 = 311;
pub const RPL_AWAY: u16 = 301;
pub const RPL_ENDOFWHOIS: u16 = 318;
pub const RPL_NAMREPLY: u16 = 353;
pub const RPL_ENDOFNAMES: u16 = 366;
pub const RPL_INVITING: u16 = 341;
pub const RPL_BANLIST: u16 = 367;
pub const RPL_ENDOFBANLIST: u16 = 368;
pub const RPL_USERHOST: u16 = 302;
pub const ERR_NOSUCHNICK: u16 = 401;
pub const ERR_UNKNOWNCOMMAND: u16 = 421;
pub const ERR_UNAVAILRESOURCE: u16 = 437;
pub const ERR_PASSWDMISMATCH: u16 = 464;
pub const ERR_UNKNOWNMODE: u16 = 472;
pub const ERR_NEEDREGGEDNICK: u16 = 477;
pub const ERR_NOPRIVILEGES: u16 = 481;

/// Build a numeric reply addressed to `nick`, with `server_name` as the
/// message's source.
pub fn reply(server_name: &str, nick: &str, numeric: u16, mut args: Vec<String>) -> Message {
    let mut params = vec![nick.to_string()];
    params.append(&mut args);
    Message::with_prefix(server_name, format!("{numeric:03}"), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_places_nick_first_and_pads_numeric() {
        let m = reply("passerd", "alice", RPL_WELCOME, vec!["Welcome!".into()]);
        assert_eq!(m.command, "001");
        assert_eq!(m.params, vec!["alice", "Welcome!"]);
        assert_eq!(m.to_string(), ":passerd 001 alice :Welcome!");
    }
}
