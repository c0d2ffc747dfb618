use core::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

mod parse;

pub use parse::{
    extract_audio_payload_type, extract_payload_map, extract_red_generations,
    extract_remote_transport, TextFormat,
};

/// Payload number used for t140 when the caller expresses no preference.
pub const DEFAULT_T140_PT: u8 = 100;
/// Payload number used for the redundancy wrapper when the caller expresses
/// no preference.
pub const DEFAULT_RED_PT: u8 = 101;
/// Redundancy generations advertised in the fmtp descriptor.
pub const RED_GENERATIONS: usize = 4;
/// Port advertised on the placeholder audio line. Nothing is ever sent or
/// received there; some proxies reject sessions without an audio media line.
pub const DUMMY_AUDIO_PORT: u16 = 11_000;
/// PCMU, the static payload type used on the placeholder audio line.
pub const DEFAULT_AUDIO_PT: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("invalid SDP: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMedia {
    pub port: u16,
    pub t140_pt: u8,
    /// `None` when redundancy was omitted from the negotiation.
    pub red_pt: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMedia {
    pub port: u16,
    pub payload_type: u8,
}

/// One session description with exactly one text media section and one
/// placeholder audio section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin_user: String,
    pub session_id: u64,
    pub connection_address: String,
    pub text: TextMedia,
    pub audio: AudioMedia,
}

/// Build an offer for a text call from `origin_user` at
/// `address`:`text_port`.
///
/// `preferred_t140` and `preferred_red` are payload numbers; `0` means "no
/// preference" and selects 100/101. `preferred_red = -1` omits the
/// redundancy format entirely.
pub fn build_offer(
    origin_user: &str,
    address: &str,
    text_port: u16,
    preferred_t140: u8,
    preferred_red: i16,
) -> SessionDescription {
    let t140_pt = if preferred_t140 == 0 {
        DEFAULT_T140_PT
    } else {
        preferred_t140
    };

    let red_pt = match preferred_red {
        n if n < 0 => None,
        0 => Some(DEFAULT_RED_PT),
        n => Some(n as u8),
    };

    SessionDescription {
        origin_user: origin_user.to_string(),
        session_id: unix_session_id(),
        connection_address: address.to_string(),
        text: TextMedia {
            port: text_port,
            t140_pt,
            red_pt,
        },
        audio: AudioMedia {
            port: DUMMY_AUDIO_PORT,
            payload_type: DEFAULT_AUDIO_PT,
        },
    }
}

/// Build an answer to `peer_offer`, mirroring the payload numbers the peer
/// proposed instead of issuing new ones. A peer that offered no redundancy
/// gets none back; a peer whose offer cannot be parsed at all gets the
/// defaults (the caller decides separately whether the offer is acceptable).
pub fn build_answer(
    peer_offer: &str,
    origin_user: &str,
    address: &str,
    text_port: u16,
) -> SessionDescription {
    let t140_pt =
        extract_payload_map(peer_offer, TextFormat::T140).unwrap_or(DEFAULT_T140_PT);
    let red_pt = extract_payload_map(peer_offer, TextFormat::Red);
    let audio_pt =
        extract_audio_payload_type(peer_offer).unwrap_or(DEFAULT_AUDIO_PT);

    SessionDescription {
        origin_user: origin_user.to_string(),
        session_id: unix_session_id(),
        connection_address: address.to_string(),
        text: TextMedia {
            port: text_port,
            t140_pt,
            red_pt,
        },
        audio: AudioMedia {
            port: DUMMY_AUDIO_PORT,
            payload_type: audio_pt,
        },
    }
}

impl SessionDescription {
    /// Render to wire format. Line order follows RFC 4566: session level
    /// first, then the text media section, then the placeholder audio
    /// section.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);

        let _ = write!(
            out,
            "v=0\r\n\
             o={user} {id} {id} IN IP4 {addr}\r\n\
             s=-\r\n\
             c=IN IP4 {addr}\r\n\
             t=0 0\r\n",
            user = self.origin_user,
            id = self.session_id,
            addr = self.connection_address,
        );

        match self.text.red_pt {
            Some(red) => {
                let t140 = self.text.t140_pt;
                let _ = write!(
                    out,
                    "m=text {port} RTP/AVP {t140} {red}\r\n\
                     a=rtpmap:{t140} t140/1000\r\n\
                     a=rtpmap:{red} red/1000\r\n\
                     a=fmtp:{red} {t140}/{t140}/{t140}/{t140}\r\n",
                    port = self.text.port,
                );
            }
            None => {
                let _ = write!(
                    out,
                    "m=text {port} RTP/AVP {t140}\r\n\
                     a=rtpmap:{t140} t140/1000\r\n",
                    port = self.text.port,
                    t140 = self.text.t140_pt,
                );
            }
        }
        out.push_str("a=sendrecv\r\n");

        let _ = write!(
            out,
            "m=audio {port} RTP/AVP {pt}\r\n",
            port = self.audio.port,
            pt = self.audio.payload_type,
        );
        if self.audio.payload_type == DEFAULT_AUDIO_PT {
            out.push_str("a=rtpmap:0 PCMU/8000\r\n");
        }

        out
    }
}

fn unix_session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
