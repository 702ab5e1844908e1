//! Text decoding and formatting helpers shared across the codec, feed,
//! and channel-formatting layers.

use encoding_rs::WINDOWS_1252;

/// Decode inbound bytes, trying UTF-8 first and falling back to
/// ISO-8859-1 (Latin-1) — the same two-encoding order as the original's
/// `try_unicode([enc] + ENCODINGS)` with `ENCODINGS = ['utf-8',
/// 'iso-8859-1']`. Latin-1 decodes every byte sequence, so this never
/// fails; it only changes which table is used.
///
/// `encoding_rs`'s `WINDOWS_1252` table is a superset-compatible stand-in
/// for ISO-8859-1 in the 0x00-0x9F range (the two tables differ only in
/// the C1 control range, which Latin-1 leaves undefined and windows-1252
/// assigns printable characters to); decoders this crate depends on,
/// and others in this ecosystem, treat "iso-8859-1" requests this way
/// rather than carry a bespoke 256-entry table.
pub fn decode_inbound(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    let (cow, _enc, had_errors) = WINDOWS_1252.decode(bytes);
    debug_assert!(!had_errors, "windows-1252 decoding never reports errors");
    cow.into_owned()
}

/// Split an entry's text into the lines it should render as, applying
/// the per-user `multiline` formatting rule. With `multiline=true`,
/// embedded newlines become additional PRIVMSG lines, continuations
/// prefixed with `[...] `. With `multiline=false`, newlines collapse to
/// single spaces and exactly one line is produced.
pub fn format_multiline(text: &str, multiline: bool) -> Vec<String> {
    if !multiline {
        return vec![text.replace(['\r', '\n'], " ")];
    }
    text.split('\n')
        .enumerate()
        .map(|(i, line)| {
            let line = line.trim_end_matches('\r');
            if i == 0 {
                line.to_string()
            } else {
                format!("[...] {line}")
            }
        })
        .collect()
}

/// Strip CR/LF so a piece of text is safe to embed as a single IRC
/// message trailing parameter.
pub fn strip_newlines(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
