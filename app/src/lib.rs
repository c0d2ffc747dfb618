use std::io::BufRead;
use std::net::UdpSocket;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;

use log::info;
use thiserror::Error;

use crate::events::EventHub;
use crate::messages::{PhoneEvent, PhoneHandle};
use crate::tasks::{
    signaling::SignalingTask,
    task::{start_all, AppTask},
    text_rx::TextRxTask,
    text_tx::TextTxTask,
};

pub mod diff;
pub mod events;
pub mod messages;
pub mod session;
mod settings;
mod tasks;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn run() -> Result<(), AppError> {
    info!("starting rtt-phone runtime");

    let settings = &settings::SETTINGS;

    // One text media socket: RX owns it, TX sends from a clone so outbound
    // packets leave from the advertised port.
    let text_socket = UdpSocket::bind("0.0.0.0:0")?;
    let text_port = text_socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let text_socket_tx = text_socket.try_clone()?;

    let (cmd_tx, cmd_rx) = channel();
    let (text_tx_tx, text_tx_rx) = channel();
    let (text_rx_tx, text_rx_rx) = channel();

    let hub = Arc::new(EventHub::new());
    // Subscribe before any task runs; session events can then never be
    // announced before an observer exists.
    let ui_events = hub.subscribe();

    let signaling = Box::new(SignalingTask::new(
        settings,
        text_port,
        cmd_rx,
        hub.clone(),
        text_tx_tx,
        text_rx_tx,
    ));
    let text_tx_task = Box::new(TextTxTask::new(text_socket_tx, text_tx_rx, hub.clone()));
    let text_rx_task = Box::new(TextRxTask::new(text_socket, text_rx_rx, hub.clone()));

    let tasks: Vec<Box<dyn AppTask>> = vec![signaling, text_tx_task, text_rx_task];
    start_all(tasks);

    console_loop(PhoneHandle::new(cmd_tx), ui_events)
}

/// Line-oriented console front end: slash commands control the call, any
/// other line becomes the new content of the local text field.
fn console_loop(
    phone: PhoneHandle,
    events: Receiver<PhoneEvent>,
) -> Result<(), AppError> {
    thread::spawn(move || {
        for event in events {
            match event {
                PhoneEvent::RemoteText { text, .. } => info!("[peer] {text}"),
                PhoneEvent::IncomingCall { from } => {
                    info!("incoming call from {from} (/accept or /decline)")
                }
                PhoneEvent::LocalTextReverted { text } => {
                    info!("edit not transmissible; field restored to \"{text}\"")
                }
                other => info!("{other:?}"),
            }
        }
    });

    info!("commands: /call [uri] /accept /decline /hangup /register /unregister /netchange /quit");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();

        match line.split_once(' ').map_or((line, ""), |(a, b)| (a, b)) {
            ("/call", target) => phone.call(target.trim()),
            ("/accept", _) => phone.accept(),
            ("/decline", _) => phone.decline(),
            ("/hangup", _) => phone.hang_up(),
            ("/register", _) => phone.register(),
            ("/unregister", _) => phone.unregister(),
            ("/netchange", _) => phone.network_changed(),
            ("/quit", _) => break,
            ("", _) => {}
            _ => phone.send_text(line),
        }
    }

    Ok(())
}
