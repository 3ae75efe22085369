//! Outbound/inbound text formatting: XML-ish prompt payloads for
//! inbound messages, and `<internal>` stripping for outbound agent text.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::Message;

static INTERNAL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<internal>.*?</internal>").expect("valid regex"));

/// Escapes the five characters that matter inside an XML-like attribute
/// or text node: `& < > "`.
pub fn escape_xml(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Serializes a batch of messages into the `<messages>` prompt payload
/// the agent receives, escaping all user-sourced strings.
pub fn format_messages(messages: &[Message]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for m in messages {
        lines.push(format!(
            r#"<message sender="{}" time="{}">{}</message>"#,
            escape_xml(&m.sender_display),
            m.timestamp.to_rfc3339(),
            escape_xml(&m.content),
        ));
    }
    format!("<messages>\n{}\n</messages>", lines.join("\n"))
}

/// Removes every `<internal>...</internal>` span, non-greedy and
/// spanning newlines, then trims the remainder.
pub fn strip_internal_tags(text: &str) -> String {
    INTERNAL_TAG.replace_all(text, "").trim().to_string()
}

/// The outbound formatting entry point: strip internal commentary: an
/// empty result after stripping means "do not send".
pub fn format_outbound(raw_text: &str) -> String {
    strip_internal_tags(raw_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(sender: &str, content: &str) -> Message {
        Message {
            delivery_id: "d1".into(),
            chat: "github:acme/widgets#issue:1".parse().unwrap(),
            sender_handle: "alice".into(),
            sender_display: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_bot: false,
        }
    }

    #[test]
    fn escapes_all_five_characters() {
        assert_eq!(escape_xml(r#"<a & "b" >"#), "&lt;a &amp; &quot;b&quot; &gt;");
    }

    #[test]
    fn escape_xml_of_empty_is_empty() {
        assert_eq!(escape_xml(""), "");
    }

    #[test]
    fn format_messages_escapes_sender_and_content() {
        let payload = format_messages(&[msg("<bob>", "hi & bye")]);
        assert!(payload.contains("sender=\"&lt;bob&gt;\""));
        assert!(payload.contains("hi &amp; bye"));
        assert!(payload.starts_with("<messages>"));
        assert!(payload.ends_with("</messages>"));
    }

    #[test]
    fn strips_single_internal_span() {
        let text = "before<internal>secret plan</internal>after";
        assert_eq!(strip_internal_tags(text), "beforeafter");
    }

    #[test]
    fn strips_internal_span_across_newlines_non_greedy() {
        let text = "keep<internal>\nline one\nline two\n</internal><internal>second</internal>tail";
        assert_eq!(strip_internal_tags(text), "keeptail");
    }

    #[test]
    fn format_outbound_trims_remainder() {
        assert_eq!(
            format_outbound("  <internal>x</internal>  hello  "),
            "hello"
        );
    }

    #[test]
    fn format_outbound_of_only_internal_commentary_is_empty() {
        assert_eq!(format_outbound("<internal>only thoughts</internal>"), "");
    }

    #[test]
    fn round_trip_law_wrap_then_format_equals_trimmed_tail() {
        // format_outbound(wrap_in_internal(x) + y) == trim(y) for y without <internal> tags
        let x = "hidden reasoning";
        let y = "  visible reply  ";
        let wrapped = format!("<internal>{x}</internal>{y}");
        assert_eq!(format_outbound(&wrapped), y.trim());
    }
}
