use std::net::SocketAddr;
use std::time::Instant;

use crate::{
    dialog::{stateless_response, Dialog, DialogState, InviteOutcome},
    message::{cseq_method, Header, Message, Method, Request, Response},
    registration::{RegistrationResult, RegistrationState, RegistrationTransaction},
    transaction::{InviteArrival, InviteServerTransactionManager},
    DigestChallenge,
};

const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreRegistrationEvent {
    Result(RegistrationResult),
    StateChanged(RegistrationState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCallEvent {
    /// A new INVITE transaction. Admission (busy, duplicate call key) is the
    /// application's decision; the dialog is untouched until it admits.
    IncomingInvite { request: Request },
    /// Retransmitted INVITE; any replayed response is already queued.
    RepeatedInvite,
    PeerRinging { status: u16 },
    /// Peer accepted our INVITE. The ACK is queued; the response body holds
    /// the SDP answer.
    PeerAccepted { response: Response },
    /// Peer refused our INVITE. The ACK is queued.
    PeerRejected { status: u16 },
    PeerCancelled,
    AckReceived,
    ByeReceived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    Registration(CoreRegistrationEvent),
    Call(CoreCallEvent),
    SendResponse(Response),
    SendRequest(Request),
}

/// High-level SIP stack wiring registration, the call dialog and the INVITE
/// transaction manager together, converting incoming messages into events.
///
/// This does *not* perform any I/O. The caller parses text into `Message`
/// (via `parse_message`) and sends whatever `SendRequest`/`SendResponse`
/// events tell it to.
#[derive(Debug, Default)]
pub struct SipStack {
    pub registration: RegistrationTransaction,
    pub dialog: Dialog,
    pub invite_tx: InviteServerTransactionManager,
    last_reg_state: RegistrationState,
}

impl SipStack {
    pub fn new() -> Self {
        Self {
            dialog: Dialog::new(),
            ..Self::default()
        }
    }

    /// Replace the dialog for a fresh call attempt, keeping Via/Contact.
    pub fn reset_dialog(&mut self) {
        self.dialog = Dialog::new();
    }

    /// Handle any incoming message and emit high-level events.
    pub fn on_message(
        &mut self,
        msg: Message,
        remote: SocketAddr,
        now: Instant,
    ) -> Vec<CoreEvent> {
        match msg {
            Message::Response(resp) => self.on_response(resp),
            Message::Request(req) => self.on_request(req, remote, now),
        }
    }

    fn on_response(&mut self, resp: Response) -> Vec<CoreEvent> {
        let mut events = Vec::new();

        match cseq_method(&resp.headers) {
            Some("REGISTER") => {
                let result = self.registration.handle_response(&resp);
                events.push(CoreEvent::Registration(CoreRegistrationEvent::Result(
                    result,
                )));

                let state = self.registration.state();
                if state != self.last_reg_state {
                    self.last_reg_state = state;
                    events.push(CoreEvent::Registration(
                        CoreRegistrationEvent::StateChanged(state),
                    ));
                }
            }
            Some("INVITE") => match self.dialog.handle_invite_response(&resp) {
                InviteOutcome::PeerRinging => {
                    events.push(CoreEvent::Call(CoreCallEvent::PeerRinging {
                        status: resp.status_code,
                    }));
                }
                InviteOutcome::Accepted { ack } => {
                    events.push(CoreEvent::SendRequest(ack));
                    events.push(CoreEvent::Call(CoreCallEvent::PeerAccepted {
                        response: resp,
                    }));
                }
                InviteOutcome::Rejected { status, ack } => {
                    events.push(CoreEvent::SendRequest(ack));
                    events.push(CoreEvent::Call(CoreCallEvent::PeerRejected { status }));
                }
                InviteOutcome::Ignored => {
                    log::debug!("ignoring INVITE response {}", resp.status_code);
                }
            },
            Some("BYE") | Some("CANCEL") => {
                // Final answers to our own teardown requests; nothing to do.
                log::debug!("teardown response {}", resp.status_code);
            }
            _ => {
                log::warn!("unhandled response {}", resp.status_code);
            }
        }

        events
    }

    fn on_request(
        &mut self,
        req: Request,
        remote: SocketAddr,
        now: Instant,
    ) -> Vec<CoreEvent> {
        let mut events = Vec::new();

        match req.method {
            Method::Invite => match self.invite_tx.on_invite(&req, remote) {
                InviteArrival::New => {
                    events.push(CoreEvent::Call(CoreCallEvent::IncomingInvite {
                        request: req,
                    }));
                }
                InviteArrival::Retransmission(replay) => {
                    if let Some(resp) = replay {
                        events.push(CoreEvent::SendResponse(resp));
                    }
                    events.push(CoreEvent::Call(CoreCallEvent::RepeatedInvite));
                }
            },
            Method::Cancel => match self.dialog.handle_incoming_cancel(&req) {
                Ok(outcome) => {
                    events.push(CoreEvent::SendResponse(outcome.cancel_ok));
                    if let Some(resp_487) = outcome.invite_487 {
                        self.invite_tx.on_outgoing_response(&resp_487, remote, now);
                        events.push(CoreEvent::SendResponse(resp_487));
                        events.push(CoreEvent::Call(CoreCallEvent::PeerCancelled));
                    }
                }
                Err(e) => {
                    log::debug!("absorbing stray CANCEL: {e}");
                }
            },
            Method::Ack => {
                self.invite_tx.on_ack(&req, now);
                if self.dialog.handle_incoming_ack(&req).is_ok() {
                    events.push(CoreEvent::Call(CoreCallEvent::AckReceived));
                }
            }
            Method::Bye => {
                let already_down = self.dialog.state == DialogState::Terminated;
                match self.dialog.handle_incoming_bye(&req) {
                    Ok(resp) => {
                        events.push(CoreEvent::SendResponse(resp));
                        if !already_down {
                            events.push(CoreEvent::Call(CoreCallEvent::ByeReceived));
                        }
                    }
                    Err(e) => {
                        log::debug!("absorbing stray BYE: {e}");
                    }
                }
            }
            Method::Options => match stateless_response(&req, 200, "OK") {
                Ok(mut resp) => {
                    resp.headers.insert(0, Header::new("Allow", ALLOW));
                    events.push(CoreEvent::SendResponse(resp));
                }
                Err(e) => log::debug!("cannot answer OPTIONS: {e}"),
            },
            Method::Register => {
                log::warn!("ignoring REGISTER request; we are not a registrar");
            }
        }

        events
    }

    /// Record an outgoing response so the transaction layer can retransmit
    /// it and recognize duplicate INVITEs.
    pub fn record_response(&mut self, resp: &Response, remote: SocketAddr, now: Instant) {
        self.invite_tx.on_outgoing_response(resp, remote, now);
    }

    /// Advance transaction timers; returns responses due for retransmission.
    pub fn poll(&mut self, now: Instant) -> Vec<(Response, SocketAddr)> {
        self.invite_tx.poll(now)
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn last_challenge(&self) -> Option<DigestChallenge> {
        self.registration.last_challenge()
    }

    /// Suggested refresh interval in seconds based on the last Expires.
    pub fn registration_refresh_interval_secs(&self) -> u64 {
        self.registration.next_refresh_interval_secs()
    }
}
