//! Minimal SIP signaling layer for a single-line phone: message grammar,
//! INVITE dialog handling, REGISTER transaction with digest auth, and an
//! INVITE server-transaction manager for retransmission and duplicate
//! suppression. No I/O happens here; the application owns the sockets and
//! feeds parsed messages in.

use thiserror::Error;

mod auth;
mod dialog;
mod message;
mod registration;
mod stack;
mod transaction;

pub use auth::{
    authorization_header, compute_digest_response, parse_www_authenticate,
    DigestChallenge, DigestCredentials,
};
pub use dialog::{
    stateless_response, CancelOutcome, Dialog, DialogRole, DialogState,
    InviteOutcome, SipDialogId,
};
pub use message::{
    header_value, parse_message, Header, Message, Method, Request, Response,
};
pub use registration::{
    RegistrationResult, RegistrationState, RegistrationTransaction,
};
pub use stack::{CoreCallEvent, CoreEvent, CoreRegistrationEvent, SipStack};
pub use transaction::{InviteArrival, InviteServerTransactionManager};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SipError {
    #[error("invalid message: {0}")]
    Invalid(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, SipError>;
