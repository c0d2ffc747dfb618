//! RFC 4103 real-time text over RTP: the T.140 byte protocol, the RFC 2198
//! redundancy envelope, and the per-session packetizer/depacketizer.

mod error;
mod recv;
mod red;
mod rtp;
mod send;
mod text;

pub use error::TextError;
pub use recv::{ReceiverConfig, TextReceiver};
pub use rtp::{RtpHeader, RtpPacket, MAX_DATAGRAM, MAX_TEXT_PAYLOAD};
pub use send::{SenderConfig, TextSender};
pub use text::{parse_text_payload, render_events, TextEvent, BACKSPACE};

/// Redundancy generations carried per packet (primary included) unless the
/// negotiation says otherwise.
pub const DEFAULT_GENERATIONS: usize = 4;
