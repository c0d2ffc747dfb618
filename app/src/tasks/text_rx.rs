use std::io::ErrorKind::WouldBlock;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rtp_text::TextReceiver;

use crate::diff::DisplayBuffer;
use crate::events::EventHub;
use crate::messages::{PhoneEvent, TextRxCommand, TextRxCommandReceiver};
use crate::tasks::task::{AppTask, TaskMeta};

const RX_BUF_SIZE: usize = 1500;

/// Owns the UDP socket bound to our advertised text port. Listens for
/// inbound RTP, filters on the negotiated remote endpoint, runs packets
/// through the depacketizer and replays the recovered events onto the
/// remote display buffer.
pub struct TextRxTask {
    socket: UdpSocket,
    cmd_rx: TextRxCommandReceiver,
    hub: Arc<EventHub>,
    buf: [u8; RX_BUF_SIZE],

    stream: Option<Stream>,
}

struct Stream {
    remote: SocketAddr,
    receiver: TextReceiver,
    display: DisplayBuffer,
}

impl AppTask for TextRxTask {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "text-rx",
            stack_bytes: None,
        }
    }

    fn into_runner(mut self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || {
            self.run();
        })
    }
}

impl TextRxTask {
    pub fn new(
        socket: UdpSocket,
        cmd_rx: TextRxCommandReceiver,
        hub: Arc<EventHub>,
    ) -> Self {
        // Best-effort: if this fails we'll just block in recv_from.
        let _ = socket.set_nonblocking(true);

        Self {
            socket,
            cmd_rx,
            hub,
            buf: [0u8; RX_BUF_SIZE],
            stream: None,
        }
    }

    fn run(&mut self) {
        log::info!(
            "text RX task started on {}",
            self.socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        );

        loop {
            if !self.poll_commands() {
                log::info!("text RX task exiting: command channel closed");
                break;
            }

            if self.stream.is_some() {
                self.poll_socket();
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    fn poll_commands(&mut self) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_command(&mut self, cmd: TextRxCommand) {
        match cmd {
            TextRxCommand::Start { remote, config } => {
                log::info!(
                    "text RX start: remote={remote}, t140={}, red={:?}",
                    config.t140_pt,
                    config.red_pt
                );
                self.stream = Some(Stream {
                    remote,
                    receiver: TextReceiver::new(config),
                    display: DisplayBuffer::new(),
                });
            }
            TextRxCommand::Stop => {
                if let Some(stream) = self.stream.take() {
                    log::info!(
                        "text RX stopped ({} discarded, {} lost)",
                        stream.receiver.discarded(),
                        stream.receiver.lost()
                    );
                }
            }
        }
    }

    fn poll_socket(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((len, addr)) => self.handle_packet(len, addr),
                Err(ref e) if e.kind() == WouldBlock => break,
                Err(e) => {
                    log::warn!("text RX socket error: {e:?}");
                    break;
                }
            }
        }
    }

    fn handle_packet(&mut self, len: usize, addr: SocketAddr) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        if stream.remote.ip() != addr.ip() {
            log::debug!("text RX: ignoring packet from unexpected {addr}");
            return;
        }

        let events = match stream.receiver.decode(&self.buf[..len]) {
            Ok(events) => events,
            Err(e) => {
                log::debug!("text RX: decode failed: {e:?}");
                return;
            }
        };

        for event in events {
            stream.display.apply(&event);
            self.hub.broadcast(PhoneEvent::RemoteText {
                event,
                text: stream.display.as_str().to_string(),
            });
        }
    }
}
