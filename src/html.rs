//! HTML entity decoding of remote entry text.
//!
//! Remote text is decoded through a full named+numeric HTML entity pass
//! and then, separately, `&lt;`/`&gt;` are unescaped a second time — the
//! remote double-encodes those two.

use htmlentity::entity::{decode, ICodedDataTrait};

/// One pass of named (`&aacute;`) and numeric (`&#233;`) entity decoding.
pub fn decode_entities(s: &str) -> String {
    decode(s).to_string().unwrap_or_else(|_| s.to_string())
}

/// Undo the double-escaping of `<`/`>` that survives a first entity-decode
/// pass (the remote encodes these twice).
fn undo_double_escaped_angle_brackets(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">")
}

/// Full decode used on every entry's text before display: a complete
/// entity decode, then the extra angle-bracket pass.
pub fn full_entity_decode(s: &str) -> String {
    undo_double_escaped_angle_brackets(&decode_entities(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_entities_resolve() {
        assert_eq!(decode_entities("caf&eacute;"), "café");
    }

    #[test]
    fn numeric_entities_resolve() {
        assert_eq!(decode_entities("&#233;"), "é");
    }

    #[test]
    fn double_encoded_angle_brackets_unescape_fully() {
        // the remote encodes '<' as '&amp;lt;', i.e. '&' then 'lt;'
        // literally, so a first entity-decode pass turns it into '&lt;'
        // and a second, targeted pass is needed to get '<'.
        assert_eq!(full_entity_decode("&amp;lt;3"), "<3");
        assert_eq!(full_entity_decode("&amp;gt;implying"), ">implying");
    }

    #[test]
    fn plain_text_is_unaffected() {
        assert_eq!(full_entity_decode("just plain text"), "just plain text");
    }
}
