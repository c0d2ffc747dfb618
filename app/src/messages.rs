use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender};

use rtp_text::{ReceiverConfig, SenderConfig, TextEvent};
use sip_core::RegistrationState;

/// Commands into the signaling task. This channel is the phone's public
/// call-control surface; everything on it is serialized through one task,
/// which is what guarantees at most one live call at a time.
#[derive(Debug)]
pub enum PhoneCommand {
    Call(String),
    Accept,
    Decline,
    HangUp,
    SendText(String),
    Register,
    Unregister,
    /// The local network changed; re-resolve our address and, if it moved,
    /// re-register and drop any call whose transport it invalidated.
    NetworkChanged,
}

#[derive(Debug)]
pub enum TextTxCommand {
    Start {
        remote: SocketAddr,
        config: SenderConfig,
    },
    /// New full content of the local text field.
    Input(String),
    Stop,
}

#[derive(Debug)]
pub enum TextRxCommand {
    Start {
        remote: SocketAddr,
        config: ReceiverConfig,
    },
    Stop,
}

/// Everything observers can learn about the phone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneEvent {
    IncomingCall { from: String },
    CallRinging,
    SessionEstablished,
    SessionClosed { reason: String },
    SessionFailed { reason: String },
    /// One inbound text primitive plus the resulting remote display text.
    RemoteText { event: TextEvent, text: String },
    /// A local edit was not transmissible; the field must be restored.
    LocalTextReverted { text: String },
    Registration(RegistrationState),
    Status(String),
}

pub type PhoneCommandSender = Sender<PhoneCommand>;
pub type PhoneCommandReceiver = Receiver<PhoneCommand>;

pub type TextTxCommandSender = Sender<TextTxCommand>;
pub type TextTxCommandReceiver = Receiver<TextTxCommand>;

pub type TextRxCommandSender = Sender<TextRxCommand>;
pub type TextRxCommandReceiver = Receiver<TextRxCommand>;

/// Cloneable call-control handle handed to UI collaborators.
#[derive(Debug, Clone)]
pub struct PhoneHandle {
    commands: PhoneCommandSender,
}

impl PhoneHandle {
    pub fn new(commands: PhoneCommandSender) -> Self {
        Self { commands }
    }

    pub fn call(&self, target: &str) {
        self.send(PhoneCommand::Call(target.to_string()));
    }

    pub fn accept(&self) {
        self.send(PhoneCommand::Accept);
    }

    pub fn decline(&self) {
        self.send(PhoneCommand::Decline);
    }

    pub fn hang_up(&self) {
        self.send(PhoneCommand::HangUp);
    }

    pub fn send_text(&self, text: &str) {
        self.send(PhoneCommand::SendText(text.to_string()));
    }

    pub fn register(&self) {
        self.send(PhoneCommand::Register);
    }

    pub fn unregister(&self) {
        self.send(PhoneCommand::Unregister);
    }

    pub fn network_changed(&self) {
        self.send(PhoneCommand::NetworkChanged);
    }

    fn send(&self, command: PhoneCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("phone command channel closed");
        }
    }
}
