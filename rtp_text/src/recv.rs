use crate::error::TextError;
use crate::red;
use crate::rtp::RtpPacket;
use crate::text::{parse_text_payload, TextEvent};

#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    pub t140_pt: u8,
    pub red_pt: Option<u8>,
}

/// Depacketizer for one inbound text stream.
///
/// Packets that are not strictly newer than the last accepted one are
/// dropped, never reordered: real-time text prefers recency over
/// completeness. Gaps are repaired from the redundancy envelope of the next
/// packet that does arrive.
#[derive(Debug)]
pub struct TextReceiver {
    config: ReceiverConfig,
    last_sequence: Option<u16>,
    discarded: u64,
    lost: u64,
}

impl TextReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            last_sequence: None,
            discarded: 0,
            lost: 0,
        }
    }

    /// Decode one datagram into the text events it delivers, loss repair
    /// included. Out-of-order, duplicate and foreign-format packets yield
    /// an empty event list.
    pub fn decode(&mut self, datagram: &[u8]) -> Result<Vec<TextEvent>, TextError> {
        let packet = RtpPacket::unpack(datagram)?;
        let sequence = packet.header.sequence_number;

        let is_red = self.config.red_pt == Some(packet.header.payload_type);
        if !is_red && packet.header.payload_type != self.config.t140_pt {
            log::debug!(
                "dropping packet with foreign payload type {}",
                packet.header.payload_type
            );
            return Ok(Vec::new());
        }

        // `None` means this is the first packet we see: nothing has been
        // delivered yet, so every generation it carries is new.
        let missed: Option<usize> = match self.last_sequence {
            None => None,
            Some(last) if sequence_newer(sequence, last) => {
                Some(usize::from(sequence.wrapping_sub(last)) - 1)
            }
            Some(last) => {
                log::debug!("discarding stale packet {sequence} (last {last})");
                self.discarded += 1;
                return Ok(Vec::new());
            }
        };
        self.last_sequence = Some(sequence);

        let mut recovered: Vec<u8> = Vec::new();
        if is_red {
            let blocks = red::decode(&packet.payload)?;
            let redundant = blocks.len() - 1;

            let replay = match missed {
                None => redundant,
                Some(missed) => {
                    if missed > redundant {
                        self.lost += (missed - redundant) as u64;
                        log::warn!(
                            "{} packet(s) lost beyond redundancy cover",
                            missed - redundant
                        );
                    }
                    missed.min(redundant)
                }
            };

            // The newest `replay` redundant blocks cover exactly the gap;
            // older ones were already delivered in earlier packets.
            for block in &blocks[redundant - replay..] {
                recovered.extend_from_slice(&block.data);
            }
        } else {
            if let Some(missed) = missed {
                if missed > 0 {
                    self.lost += missed as u64;
                    log::warn!("{missed} packet(s) lost with redundancy disabled");
                }
            }
            recovered.extend_from_slice(&packet.payload);
        }

        Ok(parse_text_payload(&recovered))
    }

    /// Packets discarded as duplicates or reordered arrivals.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Packets whose content could not be repaired from redundancy.
    pub fn lost(&self) -> u64 {
        self.lost
    }
}

/// Serial-number comparison modulo 65536: strictly newer, wrap-safe.
fn sequence_newer(sequence: u16, last: u16) -> bool {
    sequence != last && sequence.wrapping_sub(last) < 0x8000
}
