use std::collections::VecDeque;

use heapless::Vec as HVec;

use crate::error::TextError;
use crate::red;
use crate::rtp::{RtpHeader, RtpPacket, MAX_DATAGRAM, MAX_TEXT_PAYLOAD};
use crate::DEFAULT_GENERATIONS;

#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    pub ssrc: u32,
    pub t140_pt: u8,
    /// `None` disables the redundancy envelope.
    pub red_pt: Option<u8>,
    /// Window size, primary generation included.
    pub generations: usize,
}

impl SenderConfig {
    pub fn new(ssrc: u32, t140_pt: u8, red_pt: Option<u8>) -> Self {
        Self {
            ssrc,
            t140_pt,
            red_pt,
            generations: DEFAULT_GENERATIONS,
        }
    }
}

#[derive(Debug, Clone)]
struct Generation {
    timestamp: u32,
    data: Vec<u8>,
}

/// Packetizer for one outbound text stream.
///
/// Every generation stays in the window and is re-sent as a redundant block
/// in subsequent packets until it ages out, so a receiver can repair a lost
/// packet from any of the next `generations - 1` ones.
#[derive(Debug)]
pub struct TextSender {
    config: SenderConfig,
    sequence: u16,
    window: VecDeque<Generation>,
    started: bool,
}

impl TextSender {
    pub fn new(config: SenderConfig) -> Self {
        let generations = config.generations.max(1);
        Self {
            config: SenderConfig {
                generations,
                ..config
            },
            sequence: 0,
            window: VecDeque::with_capacity(generations),
            started: false,
        }
    }

    /// Wrap `data` (already-rendered T.140 bytes) as the newest generation
    /// and emit one datagram. `timestamp` is the stream's millisecond clock.
    pub fn encode(
        &mut self,
        data: &[u8],
        timestamp: u32,
    ) -> Result<HVec<u8, MAX_DATAGRAM>, TextError> {
        while self.window.len() >= self.config.generations {
            self.window.pop_front();
        }
        self.window.push_back(Generation {
            timestamp,
            data: data.to_vec(),
        });

        let mut payload: HVec<u8, MAX_TEXT_PAYLOAD> = HVec::new();
        let payload_type = match self.config.red_pt {
            Some(red_pt) => {
                let redundant: Vec<(u16, &[u8])> = self
                    .window
                    .iter()
                    .take(self.window.len() - 1)
                    .map(|generation| {
                        let offset = timestamp.wrapping_sub(generation.timestamp);
                        (
                            offset.min(red::MAX_TS_OFFSET as u32) as u16,
                            generation.data.as_slice(),
                        )
                    })
                    .collect();
                red::encode(self.config.t140_pt, &redundant, data, &mut payload)?;
                red_pt
            }
            None => {
                payload
                    .extend_from_slice(data)
                    .map_err(|_| TextError::BufferFull)?;
                self.config.t140_pt
            }
        };

        let header = RtpHeader {
            marker: !self.started,
            payload_type,
            sequence_number: self.sequence,
            timestamp,
            ssrc: self.config.ssrc,
            ..RtpHeader::default()
        };
        self.started = true;
        self.sequence = self.sequence.wrapping_add(1);

        RtpPacket::new(header, payload).pack()
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacket;

    fn sender(red: bool) -> TextSender {
        TextSender::new(SenderConfig::new(0x1234, 100, red.then_some(101)))
    }

    #[test]
    fn sequence_increments_by_one_and_wraps() {
        let mut tx = sender(false);
        tx.sequence = u16::MAX;
        let first = tx.encode(b"a", 0).unwrap();
        let second = tx.encode(b"b", 300).unwrap();

        let first = RtpPacket::unpack(&first).unwrap();
        let second = RtpPacket::unpack(&second).unwrap();
        assert_eq!(first.header.sequence_number, u16::MAX);
        assert_eq!(second.header.sequence_number, 0);
    }

    #[test]
    fn marker_set_only_on_first_packet() {
        let mut tx = sender(true);
        let first = RtpPacket::unpack(&tx.encode(b"a", 0).unwrap()).unwrap();
        let second = RtpPacket::unpack(&tx.encode(b"b", 300).unwrap()).unwrap();
        assert!(first.header.marker);
        assert!(!second.header.marker);
    }

    #[test]
    fn bare_payload_without_redundancy() {
        let mut tx = sender(false);
        let packet = RtpPacket::unpack(&tx.encode(b"hi", 0).unwrap()).unwrap();
        assert_eq!(packet.header.payload_type, 100);
        assert_eq!(&packet.payload[..], b"hi");
    }

    #[test]
    fn window_carries_previous_generations() {
        let mut tx = sender(true);
        tx.encode(b"a", 0).unwrap();
        tx.encode(b"b", 300).unwrap();
        let third = RtpPacket::unpack(&tx.encode(b"c", 600).unwrap()).unwrap();

        assert_eq!(third.header.payload_type, 101);
        let blocks = crate::red::decode(&third.payload).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].data, b"a");
        assert_eq!(blocks[0].timestamp_offset, 600);
        assert_eq!(blocks[1].data, b"b");
        assert_eq!(blocks[1].timestamp_offset, 300);
        assert_eq!(blocks[2].data, b"c");
    }

    #[test]
    fn window_ages_out_old_generations() {
        let mut tx = sender(true);
        for (i, chunk) in [b"a", b"b", b"c", b"d", b"e"].iter().enumerate() {
            tx.encode(*chunk, (i as u32) * 300).unwrap();
        }
        // window = 4 generations: b, c, d redundant + e primary
        let sixth = RtpPacket::unpack(&tx.encode(b"f", 1500).unwrap()).unwrap();
        let blocks = crate::red::decode(&sixth.payload).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].data, b"c");
        assert_eq!(blocks[3].data, b"f");
    }
}
