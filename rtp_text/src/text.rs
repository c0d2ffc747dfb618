//! The T.140 character protocol as this client uses it: UTF-8 text plus the
//! single control byte 0x08 meaning "delete the previous character". The
//! diff layer guarantees 0x08 never appears inside ordinary text content.

/// Delete-previous-character control byte.
pub const BACKSPACE: u8 = 0x08;

/// RFC 4103 keepalive character (ZERO WIDTH NO-BREAK SPACE). Some peers
/// send it while idle; it carries no content and is stripped on receive.
const KEEPALIVE: char = '\u{feff}';

/// One primitive of the real-time text stream. A full edit is serialized as
/// zero or more `Backspace` followed by zero or one `Append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEvent {
    Append(String),
    Backspace(u16),
}

/// Serialize events to the wire byte stream.
pub fn render_events(events: &[TextEvent]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        match event {
            TextEvent::Append(text) => out.extend_from_slice(text.as_bytes()),
            TextEvent::Backspace(count) => {
                out.extend(core::iter::repeat(BACKSPACE).take(*count as usize))
            }
        }
    }
    out
}

/// Parse a received payload back into events.
///
/// Invalid UTF-8 is replaced rather than rejected and keepalive characters
/// are dropped; a run of backspaces collapses into one `Backspace(n)`.
pub fn parse_text_payload(payload: &[u8]) -> Vec<TextEvent> {
    let mut events = Vec::new();
    let mut pending = String::new();
    let mut backspaces: u16 = 0;

    let flush_text = |events: &mut Vec<TextEvent>, pending: &mut String| {
        if !pending.is_empty() {
            events.push(TextEvent::Append(core::mem::take(pending)));
        }
    };
    let flush_bs = |events: &mut Vec<TextEvent>, backspaces: &mut u16| {
        if *backspaces > 0 {
            events.push(TextEvent::Backspace(core::mem::replace(backspaces, 0)));
        }
    };

    for ch in String::from_utf8_lossy(payload).chars() {
        if ch == BACKSPACE as char {
            flush_text(&mut events, &mut pending);
            backspaces = backspaces.saturating_add(1);
        } else if ch == KEEPALIVE {
            continue;
        } else {
            flush_bs(&mut events, &mut backspaces);
            pending.push(ch);
        }
    }

    flush_text(&mut events, &mut pending);
    flush_bs(&mut events, &mut backspaces);
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_backspaces_then_append() {
        let bytes = render_events(&[
            TextEvent::Backspace(2),
            TextEvent::Append("hey".into()),
        ]);
        assert_eq!(bytes, b"\x08\x08hey");
    }

    #[test]
    fn parses_mixed_stream() {
        let events = parse_text_payload(b"ab\x08\x08c");
        assert_eq!(
            events,
            vec![
                TextEvent::Append("ab".into()),
                TextEvent::Backspace(2),
                TextEvent::Append("c".into()),
            ]
        );
    }

    #[test]
    fn round_trips() {
        let events = vec![
            TextEvent::Append("hell".into()),
            TextEvent::Backspace(1),
            TextEvent::Append("p!".into()),
        ];
        assert_eq!(parse_text_payload(&render_events(&events)), events);
    }

    #[test]
    fn strips_keepalive_characters() {
        let events = parse_text_payload("\u{feff}".as_bytes());
        assert!(events.is_empty());

        let events = parse_text_payload("a\u{feff}b".as_bytes());
        assert_eq!(events, vec![TextEvent::Append("ab".into())]);
    }

    #[test]
    fn invalid_utf8_is_absorbed() {
        let events = parse_text_payload(&[0x61, 0xff, 0x62]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TextEvent::Append(s) => assert!(s.starts_with('a') && s.ends_with('b')),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
