use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rtp_text::{render_events, TextSender};

use crate::diff::{EditOutcome, TextDiffEngine};
use crate::events::EventHub;
use crate::messages::{PhoneEvent, TextTxCommand, TextTxCommandReceiver};
use crate::tasks::task::{AppTask, TaskMeta};

/// Turns local text-field updates into the outbound character stream: diffs
/// each update against the last transmitted state, renders the events to
/// T.140 bytes and sends them through the packetizer.
pub struct TextTxTask {
    socket: UdpSocket,
    cmd_rx: TextTxCommandReceiver,
    hub: Arc<EventHub>,

    stream: Option<Stream>,
}

struct Stream {
    remote: SocketAddr,
    sender: TextSender,
    diff: TextDiffEngine,
    epoch: Instant,
}

impl AppTask for TextTxTask {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "text-tx",
            stack_bytes: None,
        }
    }

    fn into_runner(mut self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || {
            self.run();
        })
    }
}

impl TextTxTask {
    pub fn new(
        socket: UdpSocket,
        cmd_rx: TextTxCommandReceiver,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            socket,
            cmd_rx,
            hub,
            stream: None,
        }
    }

    fn run(&mut self) {
        log::info!("text TX task started");

        loop {
            match self.cmd_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(cmd) => self.handle_command(cmd),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    log::info!("text TX task exiting: command channel closed");
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: TextTxCommand) {
        match cmd {
            TextTxCommand::Start { remote, config } => {
                log::info!(
                    "text TX start: remote={remote}, t140={}, red={:?}",
                    config.t140_pt,
                    config.red_pt
                );
                self.stream = Some(Stream {
                    remote,
                    sender: TextSender::new(config),
                    diff: TextDiffEngine::new(),
                    epoch: Instant::now(),
                });
            }
            TextTxCommand::Input(text) => self.handle_input(&text),
            TextTxCommand::Stop => {
                if self.stream.take().is_some() {
                    log::info!("text TX stopped");
                }
            }
        }
    }

    fn handle_input(&mut self, text: &str) {
        let Some(stream) = self.stream.as_mut() else {
            log::debug!("text TX: input without active stream");
            return;
        };

        let events = match stream.diff.observe(text) {
            EditOutcome::Send(events) => events,
            EditOutcome::Unchanged => return,
            EditOutcome::Rejected { restore } => {
                log::debug!("text TX: non-trailing edit reverted");
                self.hub
                    .broadcast(PhoneEvent::LocalTextReverted { text: restore });
                return;
            }
        };

        let bytes = render_events(&events);
        let timestamp = stream.epoch.elapsed().as_millis() as u32;
        match stream.sender.encode(&bytes, timestamp) {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, stream.remote) {
                    log::warn!("text TX send failed: {e:?}");
                }
            }
            Err(e) => log::warn!("text TX encode failed: {e:?}"),
        }
    }
}
