//! Lenient extraction from peer session descriptions.
//!
//! Everything here treats malformed or absent attributes as "feature
//! absent". A peer that sends garbage in an optional attribute loses that
//! feature, it does not break call setup.

use crate::{
    AudioMedia, SdpError, SessionDescription, TextMedia, DEFAULT_AUDIO_PT,
    DUMMY_AUDIO_PORT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    T140,
    Red,
}

impl TextFormat {
    fn encoding_name(self) -> &'static str {
        match self {
            TextFormat::T140 => "t140",
            TextFormat::Red => "red",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Session,
    Text,
    Audio,
    OtherMedia,
}

/// Scan the text media section for an `a=rtpmap` line announcing `format`
/// at 1000 Hz. Case-insensitive; `None` on absence or parse failure.
pub fn extract_payload_map(body: &str, format: TextFormat) -> Option<u8> {
    let want = format.encoding_name();
    let mut section = Section::Session;

    for line in lines(body) {
        section = advance_section(section, line);
        if section != Section::Text {
            continue;
        }

        let Some(rest) = attribute(line, "rtpmap") else {
            continue;
        };
        // "<num> <name>/<clock>[/...]"
        let mut parts = rest.split_whitespace();
        let num = parts.next().and_then(|n| n.parse::<u8>().ok());
        let mapping = parts.next();
        let (Some(num), Some(mapping)) = (num, mapping) else {
            log::debug!("ignoring malformed rtpmap: {line}");
            continue;
        };

        let mut spec = mapping.split('/');
        let name = spec.next().unwrap_or("");
        let clock = spec.next().and_then(|c| c.parse::<u32>().ok());
        if name.eq_ignore_ascii_case(want) && clock == Some(1000) {
            return Some(num);
        }
    }

    None
}

/// Remote address and port for the text media: the `m=text` port plus the
/// media-level connection line, falling back to the session-level one.
pub fn extract_remote_transport(body: &str) -> Option<(String, u16)> {
    let mut section = Section::Session;
    let mut session_addr: Option<String> = None;
    let mut text_addr: Option<String> = None;
    let mut text_port: Option<u16> = None;

    for line in lines(body) {
        section = advance_section(section, line);

        if let Some(addr) = connection_address(line) {
            match section {
                Section::Session => session_addr = Some(addr),
                Section::Text => text_addr = Some(addr),
                _ => {}
            }
            continue;
        }

        if section == Section::Text && text_port.is_none() {
            // "m=text <port> RTP/AVP ..."
            if let Some(rest) = line.strip_prefix("m=text ") {
                text_port = rest.split_whitespace().next().and_then(|p| p.parse().ok());
            }
        }
    }

    let port = text_port?;
    let addr = text_addr.or(session_addr)?;
    Some((addr, port))
}

/// Generation list from the redundancy fmtp, e.g. `100/100/100/100` ->
/// `[100, 100, 100, 100]`. Requires a negotiated red payload number.
pub fn extract_red_generations(body: &str) -> Option<Vec<u8>> {
    let red_pt = extract_payload_map(body, TextFormat::Red)?;
    let mut section = Section::Session;

    for line in lines(body) {
        section = advance_section(section, line);
        if section != Section::Text {
            continue;
        }

        let Some(rest) = attribute(line, "fmtp") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        if parts.next().and_then(|n| n.parse::<u8>().ok()) != Some(red_pt) {
            continue;
        }
        let list = parts.next()?;
        let gens: Option<Vec<u8>> =
            list.split('/').map(|g| g.parse::<u8>().ok()).collect();
        return gens.filter(|g| !g.is_empty());
    }

    None
}

/// First payload number on the peer's audio media line, used to mirror the
/// peer's suggested format on our placeholder line.
pub fn extract_audio_payload_type(body: &str) -> Option<u8> {
    for line in lines(body) {
        if let Some(rest) = line.strip_prefix("m=audio ") {
            // "<port> RTP/AVP <pt> ..."
            return rest.split_whitespace().nth(2).and_then(|p| p.parse().ok());
        }
    }
    None
}

impl SessionDescription {
    /// Parse a peer description far enough to run a call against it.
    ///
    /// Errors only when no usable text media is present, which callers treat
    /// as "peer doesn't support real-time text". Optional attributes that
    /// fail to parse are simply absent from the result.
    pub fn parse(body: &str) -> Result<Self, SdpError> {
        let (address, port) =
            extract_remote_transport(body).ok_or(SdpError::Invalid("no text media"))?;
        let t140_pt = extract_payload_map(body, TextFormat::T140)
            .ok_or(SdpError::Invalid("no t140 rtpmap"))?;

        let origin_user = lines(body)
            .find_map(|l| l.strip_prefix("o="))
            .and_then(|o| o.split_whitespace().next())
            .unwrap_or("-")
            .to_string();

        Ok(SessionDescription {
            origin_user,
            session_id: 0,
            connection_address: address.clone(),
            text: TextMedia {
                port,
                t140_pt,
                red_pt: extract_payload_map(body, TextFormat::Red),
            },
            audio: AudioMedia {
                port: DUMMY_AUDIO_PORT,
                payload_type: extract_audio_payload_type(body)
                    .unwrap_or(DEFAULT_AUDIO_PT),
            },
        })
    }
}

fn lines(body: &str) -> impl Iterator<Item = &str> {
    body.split("\r\n").flat_map(|l| l.split('\n')).map(str::trim)
}

fn advance_section(current: Section, line: &str) -> Section {
    if line.starts_with("m=text") {
        Section::Text
    } else if line.starts_with("m=audio") {
        Section::Audio
    } else if line.starts_with("m=") {
        Section::OtherMedia
    } else {
        current
    }
}

/// `a=<name>:<rest>`, case-insensitive on the attribute name.
fn attribute<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix("a=").or_else(|| line.strip_prefix("A="))?;
    let (attr, value) = rest.split_once(':')?;
    attr.eq_ignore_ascii_case(name).then_some(value.trim())
}

fn connection_address(line: &str) -> Option<String> {
    let rest = line.strip_prefix("c=")?;
    let mut parts = rest.split_whitespace();
    let _net_type = parts.next()?;
    let _addr_type = parts.next()?;
    parts.next().map(|a| a.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=alice 123 123 IN IP4 198.51.100.20\r\n\
        s=-\r\n\
        c=IN IP4 198.51.100.20\r\n\
        t=0 0\r\n\
        m=text 6000 RTP/AVP 100 101\r\n\
        a=rtpmap:100 t140/1000\r\n\
        a=rtpmap:101 red/1000\r\n\
        a=fmtp:101 100/100/100/100\r\n\
        a=sendrecv\r\n\
        m=audio 11000 RTP/AVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    #[test]
    fn finds_t140_and_red_maps() {
        assert_eq!(extract_payload_map(OFFER, TextFormat::T140), Some(100));
        assert_eq!(extract_payload_map(OFFER, TextFormat::Red), Some(101));
    }

    #[test]
    fn rtpmap_scan_is_case_insensitive() {
        let body = "m=text 6000 RTP/AVP 98\r\na=RTPMAP:98 T140/1000\r\n";
        assert_eq!(extract_payload_map(body, TextFormat::T140), Some(98));
    }

    #[test]
    fn audio_section_rtpmaps_do_not_leak_into_text() {
        let body = "m=audio 4000 RTP/AVP 96\r\n\
                    a=rtpmap:96 t140/1000\r\n\
                    m=text 6000 RTP/AVP 100\r\n\
                    a=rtpmap:100 t140/1000\r\n";
        // the bogus audio-section mapping must not win
        assert_eq!(extract_payload_map(body, TextFormat::T140), Some(100));
    }

    #[test]
    fn missing_red_is_feature_absent() {
        let body = "c=IN IP4 10.0.0.1\r\n\
                    m=text 6000 RTP/AVP 100\r\n\
                    a=rtpmap:100 t140/1000\r\n";
        assert_eq!(extract_payload_map(body, TextFormat::Red), None);
    }

    #[test]
    fn malformed_rtpmap_degrades_to_absent() {
        let body = "c=IN IP4 10.0.0.1\r\n\
                    m=text 6000 RTP/AVP 100\r\n\
                    a=rtpmap:not-a-number t140/1000\r\n\
                    a=rtpmap:100 t140/notaclock\r\n";
        assert_eq!(extract_payload_map(body, TextFormat::T140), None);
    }

    #[test]
    fn transport_prefers_media_level_connection() {
        let body = "c=IN IP4 10.0.0.1\r\n\
                    m=text 6000 RTP/AVP 100\r\n\
                    c=IN IP4 10.0.0.2\r\n\
                    a=rtpmap:100 t140/1000\r\n";
        assert_eq!(
            extract_remote_transport(body),
            Some(("10.0.0.2".to_string(), 6000))
        );
    }

    #[test]
    fn transport_falls_back_to_session_connection() {
        assert_eq!(
            extract_remote_transport(OFFER),
            Some(("198.51.100.20".to_string(), 6000))
        );
    }

    #[test]
    fn red_generation_list() {
        assert_eq!(
            extract_red_generations(OFFER),
            Some(vec![100, 100, 100, 100])
        );
    }

    #[test]
    fn parse_rejects_text_free_description() {
        let body = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0\r\n";
        assert!(SessionDescription::parse(body).is_err());
    }

    #[test]
    fn parse_accepts_full_offer() {
        let desc = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(desc.origin_user, "alice");
        assert_eq!(desc.text.port, 6000);
        assert_eq!(desc.text.t140_pt, 100);
        assert_eq!(desc.text.red_pt, Some(101));
        assert_eq!(desc.connection_address, "198.51.100.20");
    }
}
