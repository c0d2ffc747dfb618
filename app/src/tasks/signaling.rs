use std::io::ErrorKind::WouldBlock;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rtp_text::{ReceiverConfig, SenderConfig};
use sip_core::{
    authorization_header, header_value, stateless_response, CoreCallEvent,
    CoreEvent, CoreRegistrationEvent, DigestCredentials, RegistrationResult,
    RegistrationState, Request, Response, SipStack,
};

use crate::events::EventHub;
use crate::messages::{
    PhoneCommand, PhoneCommandReceiver, PhoneEvent, TextRxCommand,
    TextRxCommandSender, TextTxCommand, TextTxCommandSender,
};
use crate::session::{CallSession, CallState};
use crate::settings::Settings;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// The phone's signaling controller. Owns the SIP socket, the core stack
/// and the single call slot; every signaling transition runs on this task's
/// thread, so commands and network events can never interleave and at most
/// one call session is live at a time.
pub struct SignalingTask {
    settings: &'static Settings,
    cmd_rx: PhoneCommandReceiver,
    hub: Arc<EventHub>,
    text_tx: TextTxCommandSender,
    text_rx: TextRxCommandSender,

    // Core SIP logic
    core: SipStack,

    // The one call slot plus what we need to answer or tear it down.
    session: Option<CallSession>,
    pending_invite: Option<Request>,
    peer_addr: Option<SocketAddr>,

    // Networking
    rx_buf: [u8; 2048],
    sip_socket: UdpSocket,
    registrar_addr: Option<SocketAddr>,
    local_ip: String,
    local_sip_port: u16,
    text_port: u16,

    // Timers
    next_register: Instant,
    registration_wanted: bool,

    // Local mirror of reg state so we can log transitions
    last_reg_state: RegistrationState,

    call_counter: u32,
}

impl crate::tasks::task::AppTask for SignalingTask {
    fn meta(&self) -> crate::tasks::task::TaskMeta {
        crate::tasks::task::TaskMeta {
            name: "signaling",
            stack_bytes: None,
        }
    }

    fn into_runner(mut self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || {
            self.run();
        })
    }
}

impl SignalingTask {
    pub fn new(
        settings: &'static Settings,
        text_port: u16,
        cmd_rx: PhoneCommandReceiver,
        hub: Arc<EventHub>,
        text_tx: TextTxCommandSender,
        text_rx: TextRxCommandSender,
    ) -> Self {
        let registrar_addr = resolve_sip_target(settings.sip_registrar);
        let local_ip = resolve_local_ip(registrar_addr);

        let sip_socket = UdpSocket::bind("0.0.0.0:0").expect("create SIP socket");
        sip_socket
            .set_nonblocking(true)
            .expect("set SIP socket non-blocking");
        let local_sip_port = sip_socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(5060);

        Self {
            settings,
            cmd_rx,
            hub,
            text_tx,
            text_rx,

            core: SipStack::new(),

            session: None,
            pending_invite: None,
            peer_addr: None,

            rx_buf: [0u8; 2048],
            sip_socket,
            registrar_addr,
            local_ip,
            local_sip_port,
            text_port,

            next_register: Instant::now(),
            registration_wanted: true,
            last_reg_state: RegistrationState::Unregistered,

            call_counter: 0,
        }
    }

    fn run(&mut self) {
        log::info!(
            "signaling task started: local SIP {}:{}, text port {}",
            self.local_ip,
            self.local_sip_port,
            self.text_port
        );

        loop {
            let now = Instant::now();

            self.maybe_send_register(now);
            self.poll_retransmissions(now);
            self.poll_sip_socket(now);

            if !self.poll_commands(now) {
                log::info!("signaling task exiting: command channel closed");
                break;
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    // --- Registration --------------------------------------------------------

    fn maybe_send_register(&mut self, now: Instant) {
        if !self.registration_wanted {
            return;
        }

        let reg_state = self.core.registration.state();

        // If an attempt has been in flight for too long, treat it as a
        // timeout and allow a retry.
        if matches!(
            reg_state,
            RegistrationState::Registering | RegistrationState::Unregistering
        ) {
            if now >= self.next_register {
                log::warn!("registration attempt timed out; retrying");
                self.core.registration.reset_to_unregistered();
                self.announce_registration_state();
            }
            return;
        }

        if now < self.next_register {
            return;
        }

        // If already registered, keep the same Expires,
        // otherwise use a small initial value.
        let expires = if reg_state == RegistrationState::Registered {
            self.core.registration.last_expires()
        } else {
            30
        };

        let auth_header = self
            .core
            .last_challenge()
            .and_then(|challenge| self.build_auth_header(&challenge));

        let contact_uri = build_contact_uri(
            self.settings.sip_contact,
            &self.local_ip,
            self.local_sip_port,
        );

        let req = match self.core.registration.build_register(
            self.settings.sip_registrar,
            &contact_uri,
            &self.local_ip,
            self.local_sip_port,
            expires,
            auth_header,
        ) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("failed to build REGISTER: {e:?}");
                self.next_register = now + Duration::from_secs(30);
                return;
            }
        };

        log::info!("sending REGISTER (expires {expires})");
        self.send_to_registrar(&req.render());

        // Give a short window for the first response
        self.next_register = now + REGISTER_TIMEOUT;
    }

    fn build_auth_header(
        &self,
        challenge: &sip_core::DigestChallenge,
    ) -> Option<sip_core::Header> {
        let creds = DigestCredentials {
            username: self.settings.sip_username,
            password: self.settings.sip_password,
        };
        authorization_header(challenge, &creds, "REGISTER", self.settings.sip_registrar)
            .ok()
    }

    fn handle_registration_result(&mut self, result: RegistrationResult) {
        match result {
            RegistrationResult::Registered(_) => {
                let refresh_secs = self.core.registration_refresh_interval_secs().max(5);
                log::info!("registration succeeded; refresh in {refresh_secs}s");
                self.next_register = Instant::now() + Duration::from_secs(refresh_secs);
            }
            RegistrationResult::Unregistered => {
                log::info!("unregistered");
                self.registration_wanted = false;
            }
            RegistrationResult::AuthRequired => {
                log::info!("registration: auth required; retrying");
                self.next_register = Instant::now() + Duration::from_secs(1);
            }
            RegistrationResult::Failed(code) => {
                log::warn!("registration failed with status {code}");
                self.next_register = Instant::now() + Duration::from_secs(30);
            }
        }
    }

    fn announce_registration_state(&mut self) {
        let state = self.core.registration.state();
        if state != self.last_reg_state {
            self.last_reg_state = state;
            log::info!("registration state -> {state:?}");
            self.hub.broadcast(PhoneEvent::Registration(state));
        }
    }

    // --- Network receive -----------------------------------------------------

    fn poll_retransmissions(&mut self, now: Instant) {
        for (resp, remote) in self.core.poll(now) {
            log::debug!("retransmitting {} to {remote}", resp.status_code);
            self.send_raw(&resp.render(), remote);
        }
    }

    fn poll_sip_socket(&mut self, now: Instant) {
        loop {
            match self.sip_socket.recv_from(&mut self.rx_buf) {
                Ok((len, addr)) => {
                    let Ok(text) = core::str::from_utf8(&self.rx_buf[..len]) else {
                        continue;
                    };
                    let Ok(msg) = sip_core::parse_message(text) else {
                        log::debug!("unparseable SIP message from {addr}");
                        continue;
                    };
                    let events = self.core.on_message(msg, addr, now);
                    for ev in events {
                        self.handle_core_event(ev, addr, now);
                    }
                }
                Err(ref e) if e.kind() == WouldBlock => break,
                Err(e) => {
                    log::warn!("SIP recv error: {e:?}");
                    break;
                }
            }
        }
    }

    fn handle_core_event(&mut self, ev: CoreEvent, remote_addr: SocketAddr, now: Instant) {
        match ev {
            CoreEvent::SendRequest(req) => {
                self.send_raw(&req.render(), remote_addr);
            }
            CoreEvent::SendResponse(resp) => {
                self.core.record_response(&resp, remote_addr, now);
                self.send_raw(&resp.render(), remote_addr);
            }
            CoreEvent::Registration(reg_ev) => self.handle_reg_event(reg_ev),
            CoreEvent::Call(call_ev) => {
                self.handle_call_event(call_ev, remote_addr, now)
            }
        }
    }

    fn handle_reg_event(&mut self, ev: CoreRegistrationEvent) {
        match ev {
            CoreRegistrationEvent::Result(result) => {
                self.handle_registration_result(result);
            }
            CoreRegistrationEvent::StateChanged(_) => {
                self.announce_registration_state();
            }
        }
    }

    fn handle_call_event(
        &mut self,
        ev: CoreCallEvent,
        remote_addr: SocketAddr,
        now: Instant,
    ) {
        match ev {
            CoreCallEvent::IncomingInvite { request } => {
                self.on_incoming_invite(request, remote_addr, now);
            }
            CoreCallEvent::RepeatedInvite => {
                log::debug!("retransmitted INVITE absorbed");
            }
            CoreCallEvent::PeerRinging { status } => {
                log::info!("peer ringing ({status})");
                if self.session_state() == Some(CallState::Calling) {
                    self.hub.broadcast(PhoneEvent::CallRinging);
                }
            }
            CoreCallEvent::PeerAccepted { response } => {
                self.on_peer_accepted(&response);
            }
            CoreCallEvent::PeerRejected { status } => {
                let reason = match status {
                    486 => "busy".to_string(),
                    487 => "cancelled".to_string(),
                    603 => "declined".to_string(),
                    _ => format!("call failed ({status})"),
                };
                self.terminate_session(&reason, true);
            }
            CoreCallEvent::PeerCancelled => {
                self.terminate_session("cancelled by peer", false);
            }
            CoreCallEvent::AckReceived => self.on_ack_received(),
            CoreCallEvent::ByeReceived => {
                self.terminate_session("peer hung up", false);
            }
        }
    }

    // --- Inbound call handling -----------------------------------------------

    fn on_incoming_invite(&mut self, req: Request, remote: SocketAddr, now: Instant) {
        let call_id = header_value(&req.headers, "Call-ID")
            .unwrap_or_default()
            .to_string();
        let caller = header_value(&req.headers, "From")
            .unwrap_or("unknown")
            .to_string();

        // Single-call admission. A retransmitting peer re-offering the
        // active call is ignored; anyone else gets busy.
        if let Some(session) = &self.session {
            if session.is_active() {
                if session.call_id() == call_id {
                    log::debug!("duplicate offer for active call ignored");
                } else {
                    log::info!("busy; rejecting call from {caller}");
                    self.respond_stateless(&req, 486, "Busy Here", remote, now);
                    self.hub.broadcast(PhoneEvent::Status(format!(
                        "busy: rejected call from {caller}"
                    )));
                }
                return;
            }
        }

        // The offer must carry usable text media.
        let offer = match sdp::SessionDescription::parse(&req.body) {
            Ok(offer) => offer,
            Err(e) => {
                log::info!("offer not acceptable ({e}); rejecting");
                self.respond_stateless(&req, 488, "Not Acceptable Here", remote, now);
                self.hub.broadcast(PhoneEvent::Status(
                    "rejected call without real-time text media".to_string(),
                ));
                return;
            }
        };
        let Some(remote_text) =
            to_socket_addr(&offer.connection_address, offer.text.port)
        else {
            log::info!("offer has unusable text transport; rejecting");
            self.respond_stateless(&req, 488, "Not Acceptable Here", remote, now);
            return;
        };

        self.core.reset_dialog();
        self.core.dialog.set_via(&self.local_ip, self.local_sip_port);
        self.core.dialog.set_contact(&build_contact_uri(
            self.settings.sip_contact,
            &self.local_ip,
            self.local_sip_port,
        ));
        if let Err(e) = self.core.dialog.classify_incoming_invite(&req) {
            log::warn!("malformed INVITE: {e}");
            self.respond_stateless(&req, 400, "Bad Request", remote, now);
            return;
        }

        let mut session = CallSession::inbound(&call_id, &caller);
        session.set_media(remote_text, offer.text.t140_pt, offer.text.red_pt);
        self.session = Some(session);
        self.pending_invite = Some(req.clone());
        self.peer_addr = Some(remote);

        match self
            .core
            .dialog
            .build_response_for_request(&req, 180, "Ringing", None)
        {
            Ok(resp) => {
                self.core.record_response(&resp, remote, now);
                self.send_raw(&resp.render(), remote);
            }
            Err(e) => log::warn!("cannot build 180: {e}"),
        }

        log::info!("incoming call from {caller}");
        self.hub.broadcast(PhoneEvent::IncomingCall { from: caller });
    }

    fn accept(&mut self, now: Instant) {
        let accepted = self
            .session
            .as_mut()
            .map(|s| s.transition(&[CallState::Ringing], CallState::Connecting))
            .unwrap_or(false);
        if !accepted {
            self.hub
                .broadcast(PhoneEvent::Status("no ringing call to accept".into()));
            return;
        }

        let Some(invite) = self.pending_invite.clone() else {
            self.terminate_session("lost the offer", true);
            return;
        };

        // Mirror the peer's payload numbers in the answer.
        let answer = sdp::build_answer(
            &invite.body,
            self.settings.sip_username,
            &self.local_ip,
            self.text_port,
        );
        if let Some(session) = self.session.as_mut() {
            if let Some(remote_text) = session.remote_text() {
                session.set_media(remote_text, answer.text.t140_pt, answer.text.red_pt);
            }
        }

        match self.core.dialog.build_response_for_request(
            &invite,
            200,
            "OK",
            Some(&answer.render()),
        ) {
            Ok(resp) => {
                let Some(remote) = self.peer_addr else {
                    log::warn!("no peer address for answer");
                    self.terminate_session("failed to answer", true);
                    return;
                };
                self.core.record_response(&resp, remote, now);
                self.send_raw(&resp.render(), remote);
                log::info!(
                    "accepted call after ringing {:?}",
                    self.session.as_ref().map(|s| s.age())
                );
            }
            Err(e) => {
                log::warn!("cannot build 200: {e}");
                self.terminate_session("failed to answer", true);
            }
        }
    }

    fn decline(&mut self, now: Instant) {
        if self.session_state() != Some(CallState::Ringing) {
            self.hub
                .broadcast(PhoneEvent::Status("no ringing call to decline".into()));
            return;
        }

        if let Some(invite) = self.pending_invite.clone() {
            match self
                .core
                .dialog
                .build_response_for_request(&invite, 603, "Decline", None)
            {
                Ok(resp) => {
                    if let Some(remote) = self.peer_addr {
                        self.core.record_response(&resp, remote, now);
                        self.send_raw(&resp.render(), remote);
                    }
                }
                Err(e) => log::warn!("cannot build 603: {e}"),
            }
        }

        self.terminate_session("declined", false);
    }

    fn on_ack_received(&mut self) {
        let connected = self
            .session
            .as_mut()
            .map(|s| s.transition(&[CallState::Connecting], CallState::Connected))
            .unwrap_or(false);
        if connected {
            self.start_text_streams();
            self.hub.broadcast(PhoneEvent::SessionEstablished);
        }
    }

    // --- Outbound call handling ----------------------------------------------

    fn start_call(&mut self, target: &str) {
        if self.session.as_ref().is_some_and(|s| s.is_active()) {
            log::info!("refusing to call {target}: line busy");
            self.hub.broadcast(PhoneEvent::Status(
                "busy: a call is already in progress".into(),
            ));
            return;
        }

        let target = if target.is_empty() {
            self.settings.sip_target
        } else {
            target
        };

        let Some(dest) = resolve_sip_target(target).or(self.registrar_addr) else {
            self.hub.broadcast(PhoneEvent::SessionFailed {
                reason: format!("cannot resolve {target}"),
            });
            return;
        };

        let offer = sdp::build_offer(
            self.settings.sip_username,
            &self.local_ip,
            self.text_port,
            self.settings.preferred_t140_map,
            self.settings.preferred_red_map,
        );
        let call_id = self.new_call_id();

        self.core.reset_dialog();
        let invite = match self.core.dialog.start_outgoing(
            target,
            self.settings.sip_contact,
            &build_contact_uri(
                self.settings.sip_contact,
                &self.local_ip,
                self.local_sip_port,
            ),
            &self.local_ip,
            self.local_sip_port,
            &call_id,
            &offer.render(),
        ) {
            Ok(invite) => invite,
            Err(e) => {
                self.hub.broadcast(PhoneEvent::SessionFailed {
                    reason: format!("cannot start call: {e}"),
                });
                return;
            }
        };

        self.peer_addr = Some(dest);
        if self.send_raw(&invite.render(), dest) {
            log::info!("calling {target}");
            self.session = Some(CallSession::outbound(&call_id, target));
        } else {
            self.hub.broadcast(PhoneEvent::SessionFailed {
                reason: "could not send INVITE".into(),
            });
        }
    }

    fn on_peer_accepted(&mut self, response: &Response) {
        let proceeding = self
            .session
            .as_mut()
            .map(|s| s.transition(&[CallState::Calling], CallState::Connecting))
            .unwrap_or(false);
        if !proceeding {
            log::debug!("stray 200 for no call");
            return;
        }

        // The answer is acceptable iff it advertises t140 and a usable
        // transport; anything else means the callee cannot do real-time
        // text and the call comes straight down again.
        let t140 = sdp::extract_payload_map(&response.body, sdp::TextFormat::T140);
        let transport = sdp::extract_remote_transport(&response.body)
            .and_then(|(addr, port)| to_socket_addr(&addr, port));

        let (Some(t140_pt), Some(remote_text)) = (t140, transport) else {
            log::info!("answer lacks real-time text; hanging up");
            match self.core.dialog.build_bye() {
                Ok(bye) => self.send_request(&bye),
                Err(e) => log::debug!("cannot BYE: {e}"),
            }
            self.terminate_session("callee doesn't support real-time text", true);
            return;
        };

        let red_pt = sdp::extract_payload_map(&response.body, sdp::TextFormat::Red);
        let connected = match self.session.as_mut() {
            Some(session) => {
                session.set_media(remote_text, t140_pt, red_pt);
                session.transition(&[CallState::Connecting], CallState::Connected)
            }
            None => false,
        };

        if connected {
            self.start_text_streams();
            self.hub.broadcast(PhoneEvent::SessionEstablished);
        }
    }

    // --- Teardown ------------------------------------------------------------

    fn hang_up(&mut self) {
        let Some(state) = self
            .session
            .as_ref()
            .filter(|s| s.is_active())
            .map(|s| s.state())
        else {
            self.hub
                .broadcast(PhoneEvent::Status("no active call".into()));
            return;
        };

        match state {
            CallState::Ringing => {
                self.decline(Instant::now());
                return;
            }
            CallState::Calling => match self.core.dialog.build_cancel() {
                Ok(cancel) => self.send_request(&cancel),
                Err(e) => log::debug!("cannot CANCEL: {e}"),
            },
            CallState::Connecting | CallState::Connected => {
                match self.core.dialog.build_bye() {
                    Ok(bye) => self.send_request(&bye),
                    // e.g. our 200 was never ACKed; the transaction layer
                    // times out on its own.
                    Err(e) => log::debug!("cannot BYE: {e}"),
                }
            }
            CallState::Terminated => {}
        }

        self.terminate_session("hung up", false);
    }

    /// Tear down the current session if it is still active. Safe to call on
    /// any path, including when no session exists.
    fn terminate_session(&mut self, reason: &str, failed: bool) {
        let was_active = self
            .session
            .as_mut()
            .map(|s| s.terminate())
            .unwrap_or(false);
        if !was_active {
            return;
        }

        self.stop_text_streams();
        self.pending_invite = None;

        log::info!("session ended: {reason}");
        let event = if failed {
            PhoneEvent::SessionFailed {
                reason: reason.to_string(),
            }
        } else {
            PhoneEvent::SessionClosed {
                reason: reason.to_string(),
            }
        };
        self.hub.broadcast(event);
    }

    // --- Media wiring --------------------------------------------------------

    fn start_text_streams(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(remote) = session.remote_text() else {
            log::warn!("connected session without text transport");
            return;
        };

        let t140_pt = session.t140_pt();
        let red_pt = session.red_pt();
        log::info!(
            "starting text streams to {remote} (t140={t140_pt}, red={red_pt:?})"
        );

        let _ = self.text_tx.send(TextTxCommand::Start {
            remote,
            config: SenderConfig::new(derive_ssrc(), t140_pt, red_pt),
        });
        let _ = self.text_rx.send(TextRxCommand::Start {
            remote,
            config: ReceiverConfig { t140_pt, red_pt },
        });
    }

    fn stop_text_streams(&self) {
        let _ = self.text_tx.send(TextTxCommand::Stop);
        let _ = self.text_rx.send(TextRxCommand::Stop);
    }

    fn send_text(&mut self, text: String) {
        if self.session_state() == Some(CallState::Connected) {
            let _ = self.text_tx.send(TextTxCommand::Input(text));
        } else {
            self.hub
                .broadcast(PhoneEvent::Status("no connected session".into()));
        }
    }

    // --- Network change ------------------------------------------------------

    fn handle_network_change(&mut self) {
        let new_ip = resolve_local_ip(self.registrar_addr);
        if new_ip == self.local_ip {
            log::debug!("network change notification; address unchanged");
            return;
        }
        log::info!("local address changed {} -> {new_ip}", self.local_ip);

        // In-flight RTP transport is invalid now; the call cannot survive.
        if self.session.as_ref().is_some_and(|s| s.is_active()) {
            if let Ok(bye) = self.core.dialog.build_bye() {
                self.send_request(&bye);
            }
            self.terminate_session("local address changed", false);
        }

        match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => {
                let _ = socket.set_nonblocking(true);
                self.local_sip_port = socket
                    .local_addr()
                    .map(|addr| addr.port())
                    .unwrap_or(self.local_sip_port);
                self.sip_socket = socket;
                self.local_ip = new_ip;
            }
            Err(e) => log::warn!("rebind after network change failed: {e:?}"),
        }

        self.core.registration.reset_to_unregistered();
        self.registration_wanted = true;
        self.next_register = Instant::now();
        self.announce_registration_state();
    }

    // --- Commands from UI / other tasks --------------------------------------

    fn poll_commands(&mut self, now: Instant) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd, now),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("phone command channel closed");
                    return false;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: PhoneCommand, now: Instant) {
        match cmd {
            PhoneCommand::Call(target) => self.start_call(&target),
            PhoneCommand::Accept => self.accept(now),
            PhoneCommand::Decline => self.decline(now),
            PhoneCommand::HangUp => self.hang_up(),
            PhoneCommand::SendText(text) => self.send_text(text),
            PhoneCommand::Register => {
                self.registration_wanted = true;
                self.next_register = now;
            }
            PhoneCommand::Unregister => self.unregister(),
            PhoneCommand::NetworkChanged => self.handle_network_change(),
        }
    }

    fn unregister(&mut self) {
        self.registration_wanted = false;

        let auth_header = self
            .core
            .last_challenge()
            .and_then(|challenge| self.build_auth_header(&challenge));
        let contact_uri = build_contact_uri(
            self.settings.sip_contact,
            &self.local_ip,
            self.local_sip_port,
        );

        match self.core.registration.build_unregister(
            self.settings.sip_registrar,
            &contact_uri,
            &self.local_ip,
            self.local_sip_port,
            auth_header,
        ) {
            Ok(req) => {
                log::info!("sending REGISTER (expires 0)");
                self.send_to_registrar(&req.render());
            }
            Err(e) => log::warn!("failed to build unregister: {e:?}"),
        }
    }

    // --- Send helpers --------------------------------------------------------

    fn respond_stateless(
        &mut self,
        req: &Request,
        status: u16,
        reason: &str,
        remote: SocketAddr,
        now: Instant,
    ) {
        match stateless_response(req, status, reason) {
            Ok(resp) => {
                self.core.record_response(&resp, remote, now);
                self.send_raw(&resp.render(), remote);
            }
            Err(e) => log::debug!("cannot answer request: {e}"),
        }
    }

    fn send_request(&self, req: &Request) {
        let Some(dest) = self.peer_addr.or(self.registrar_addr) else {
            log::warn!("no destination for {}", req.method);
            return;
        };
        self.send_raw(&req.render(), dest);
    }

    fn send_to_registrar(&self, payload: &str) {
        match self.registrar_addr {
            Some(addr) => {
                self.send_raw(payload, addr);
            }
            None => log::warn!("registrar address unresolved; dropping send"),
        }
    }

    /// Fire-and-forget datagram send; the return value is the only
    /// confirmation we wait for. Responses arrive as separate events.
    fn send_raw(&self, payload: &str, dest: SocketAddr) -> bool {
        match self.sip_socket.send_to(payload.as_bytes(), dest) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("SIP send to {dest} failed: {e:?}");
                false
            }
        }
    }

    fn session_state(&self) -> Option<CallState> {
        self.session.as_ref().map(|s| s.state())
    }

    fn new_call_id(&mut self) -> String {
        self.call_counter = self.call_counter.wrapping_add(1);
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{:x}-{secs:x}@{}", self.call_counter, self.local_ip)
    }
}

// --- Small helpers -----------------------------------------------------------

/// `sip:user@host:port` -> a socket address, when the host part is numeric.
/// Names fall back to the configured registrar/proxy.
fn resolve_sip_target(uri: &str) -> Option<SocketAddr> {
    let mut host = uri.trim_start_matches("sip:");
    if let Some((_, rest)) = host.split_once('@') {
        host = rest;
    }
    let host = host.split(';').next().unwrap_or(host);
    let with_port = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:5060")
    };
    with_port.parse().ok()
}

/// Route-based local address discovery: the kernel picks the source address
/// for a connected UDP socket without sending anything.
fn resolve_local_ip(probe: Option<SocketAddr>) -> String {
    let Some(probe) = probe else {
        return "127.0.0.1".to_string();
    };
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return "127.0.0.1".to_string();
    };
    if socket.connect(probe).is_err() {
        return "127.0.0.1".to_string();
    }
    socket
        .local_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn build_contact_uri(template: &str, ip: &str, port: u16) -> String {
    let user_part = template
        .trim_start_matches("sip:")
        .split('@')
        .next()
        .unwrap_or(template);
    format!("sip:{user_part}@{ip}:{port}")
}

fn to_socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    format!("{host}:{port}").parse().ok()
}

fn derive_ssrc() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ (std::process::id() << 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{TextRxCommand, TextTxCommand};
    use sip_core::{Header, Method};
    use std::sync::mpsc::channel;

    struct Fixture {
        task: SignalingTask,
        peer: UdpSocket,
        peer_addr: SocketAddr,
        events: std::sync::mpsc::Receiver<PhoneEvent>,
        _tx_rx: std::sync::mpsc::Receiver<TextTxCommand>,
        _rx_rx: std::sync::mpsc::Receiver<TextRxCommand>,
    }

    fn fixture() -> Fixture {
        let (_cmd_tx, cmd_rx) = channel();
        let (tx_tx, _tx_rx) = channel();
        let (rx_tx, _rx_rx) = channel();
        let hub = Arc::new(EventHub::new());
        let events = hub.subscribe();

        let task = SignalingTask::new(
            &crate::settings::SETTINGS,
            6000,
            cmd_rx,
            hub,
            tx_tx,
            rx_tx,
        );

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        Fixture {
            task,
            peer,
            peer_addr,
            events,
            _tx_rx,
            _rx_rx,
        }
    }

    fn invite(call_id: &str) -> Request {
        let mut req = Request::new(Method::Invite, "sip:user@example.com");
        req.add_header(Header::new("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK1"));
        req.add_header(Header::new("From", "<sip:bob@example.com>;tag=remote1"));
        req.add_header(Header::new("To", "<sip:user@example.com>"));
        req.add_header(Header::new("Call-ID", call_id));
        req.add_header(Header::new("CSeq", "1 INVITE"));
        req.add_header(Header::new("Contact", "<sip:bob@127.0.0.1:5060>"));
        req.set_body(
            "v=0\r\n\
             o=bob 1 1 IN IP4 127.0.0.1\r\n\
             c=IN IP4 127.0.0.1\r\n\
             m=text 7000 RTP/AVP 100 101\r\n\
             a=rtpmap:100 t140/1000\r\n\
             a=rtpmap:101 red/1000\r\n\
             a=fmtp:101 100/100/100/100\r\n",
            "application/sdp",
        );
        req
    }

    fn recv_text(socket: &UdpSocket) -> Option<String> {
        let mut buf = [0u8; 2048];
        for _ in 0..50 {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    return Some(String::from_utf8_lossy(&buf[..len]).to_string())
                }
                Err(ref e) if e.kind() == WouldBlock => {
                    thread::sleep(Duration::from_millis(2));
                }
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn inbound_offer_rings_and_announces() {
        let mut f = fixture();
        let now = Instant::now();
        f.task.on_incoming_invite(invite("c-1"), f.peer_addr, now);

        assert_eq!(f.task.session_state(), Some(CallState::Ringing));
        let ringing = recv_text(&f.peer).expect("no 180 sent");
        assert!(ringing.starts_with("SIP/2.0 180"), "{ringing}");
        assert!(matches!(
            f.events.try_recv().unwrap(),
            PhoneEvent::IncomingCall { .. }
        ));
    }

    #[test]
    fn second_offer_while_ringing_gets_busy() {
        let mut f = fixture();
        let now = Instant::now();
        f.task.on_incoming_invite(invite("c-1"), f.peer_addr, now);
        let _ = recv_text(&f.peer); // 180

        f.task.on_incoming_invite(invite("c-2"), f.peer_addr, now);
        let busy = recv_text(&f.peer).expect("no busy sent");
        assert!(busy.starts_with("SIP/2.0 486"), "{busy}");

        // still exactly one session, still the first call
        assert_eq!(
            f.task.session.as_ref().map(|s| s.call_id().to_string()),
            Some("c-1".to_string())
        );
    }

    #[test]
    fn duplicate_offer_is_silently_ignored() {
        let mut f = fixture();
        let now = Instant::now();
        f.task.on_incoming_invite(invite("c-1"), f.peer_addr, now);
        let _ = recv_text(&f.peer); // 180
        let _ = f.events.try_recv();

        f.task.on_incoming_invite(invite("c-1"), f.peer_addr, now);
        assert!(recv_text(&f.peer).is_none(), "duplicate offer was answered");
        assert!(f.events.try_recv().is_err(), "duplicate offer raised events");
        assert_eq!(f.task.session_state(), Some(CallState::Ringing));
    }

    #[test]
    fn outbound_call_refused_while_session_active() {
        let mut f = fixture();
        let now = Instant::now();
        f.task.on_incoming_invite(invite("c-1"), f.peer_addr, now);
        let _ = f.events.try_recv();

        f.task.start_call("sip:x@127.0.0.1:5062");
        assert!(matches!(
            f.events.try_recv().unwrap(),
            PhoneEvent::Status(s) if s.starts_with("busy")
        ));
        assert_eq!(
            f.task.session.as_ref().map(|s| s.call_id().to_string()),
            Some("c-1".to_string())
        );
    }

    #[test]
    fn offer_without_text_media_is_not_acceptable() {
        let mut f = fixture();
        let mut req = invite("c-1");
        req.set_body("v=0\r\nm=audio 4000 RTP/AVP 0\r\n", "application/sdp");

        f.task.on_incoming_invite(req, f.peer_addr, Instant::now());
        assert!(f.task.session.is_none());
        let resp = recv_text(&f.peer).expect("no response sent");
        assert!(resp.starts_with("SIP/2.0 488"), "{resp}");
    }

    #[test]
    fn accept_answers_with_mirrored_payload_numbers() {
        let mut f = fixture();
        let now = Instant::now();

        let mut req = invite("c-1");
        req.set_body(
            "v=0\r\n\
             o=bob 1 1 IN IP4 127.0.0.1\r\n\
             c=IN IP4 127.0.0.1\r\n\
             m=text 7000 RTP/AVP 96 97\r\n\
             a=rtpmap:96 t140/1000\r\n\
             a=rtpmap:97 red/1000\r\n\
             a=fmtp:97 96/96/96/96\r\n",
            "application/sdp",
        );
        f.task.on_incoming_invite(req, f.peer_addr, now);
        let _ = recv_text(&f.peer); // 180

        f.task.accept(now);
        assert_eq!(f.task.session_state(), Some(CallState::Connecting));
        let ok = recv_text(&f.peer).expect("no 200 sent");
        assert!(ok.starts_with("SIP/2.0 200"), "{ok}");
        assert!(ok.contains("a=rtpmap:96 t140/1000"), "{ok}");
        assert!(ok.contains("a=rtpmap:97 red/1000"), "{ok}");

        // final acknowledgment connects and starts media
        f.task.on_ack_received();
        assert_eq!(f.task.session_state(), Some(CallState::Connected));
        assert!(matches!(
            f._tx_rx.try_recv().unwrap(),
            TextTxCommand::Start { .. }
        ));
        assert!(matches!(
            f._rx_rx.try_recv().unwrap(),
            TextRxCommand::Start { .. }
        ));
        assert!(matches!(
            f.events.iter().take(2).last().unwrap(),
            PhoneEvent::SessionEstablished
        ));
    }

    #[test]
    fn send_text_requires_connected_session() {
        let mut f = fixture();
        f.task.send_text("hello".to_string());
        assert!(matches!(
            f.events.try_recv().unwrap(),
            PhoneEvent::Status(s) if s.contains("no connected session")
        ));
    }

    #[test]
    fn hang_up_without_session_is_a_noop() {
        let mut f = fixture();
        f.task.hang_up();
        assert!(matches!(
            f.events.try_recv().unwrap(),
            PhoneEvent::Status(_)
        ));
        assert!(f.task.session.is_none());
    }
}
