//! This module holds the vocabulary shared by every part of the protocol.
//!
//! A shuffle proceeds through a fixed sequence of phases, and every packet
//! is tagged with the phase it was sent in. Runs end with a [ReturnState],
//! which either reports success, or carries the error or blame matrix
//! explaining why the shuffle failed.
use core::fmt;

use ::serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blame::Matrix;
use crate::coin::CoinNetworkError;
use crate::crypto::{CryptographyError, Scheme};
use crate::message::FormatError;
use crate::network::NetworkError;
use crate::packet::SessionIdentifier;

pub(crate) mod mailbox;
mod monitor;

pub use monitor::Monitor;

/// The phases of a round, in the order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Uninitiated = 0,
    Announcement = 1,
    Shuffling = 2,
    BroadcastOutput = 3,
    EquivocationCheck = 4,
    VerificationAndSubmission = 5,
    Blame = 6,
    Completed = 7,
}

impl Phase {
    pub(crate) fn from_u8(x: u8) -> Option<Self> {
        let phase = match x {
            0 => Phase::Uninitiated,
            1 => Phase::Announcement,
            2 => Phase::Shuffling,
            3 => Phase::BroadcastOutput,
            4 => Phase::EquivocationCheck,
            5 => Phase::VerificationAndSubmission,
            6 => Phase::Blame,
            7 => Phase::Completed,
            _ => return None,
        };
        Some(phase)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Represents an error which can happen when running a protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The machine was asked to run while already running, or after finishing.
    #[error("protocol already started")]
    ProtocolStarted,
    #[error("invalid participant set: {0}")]
    InvalidParticipantSet(String),
    #[error("malformed message: {0}")]
    Format(#[from] FormatError),
    #[error("invalid value: {0}")]
    Value(String),
    #[error("cryptography error: {0}")]
    Cryptography(#[from] CryptographyError),
    #[error("coin network error: {0}")]
    CoinNetwork(#[from] CoinNetworkError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("timed out during {0}")]
    Timeout(Phase),
    /// Some internal invariant was broken, which indicates a bug in this crate.
    #[error("invalid implementation: {0}")]
    InvalidImplementation(String),
}

/// Represents an error which can happen when *initializing* a protocol.
///
/// These are related to bad parameters for the protocol, and things like that.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitializationError {
    #[error("bad parameters: {0}")]
    BadParameters(String),
}

/// The result of running a shuffle.
///
/// A successful run has published the shuffle transaction, and hands back the
/// key controlling our new output. A failed run carries either the error that
/// stopped it, or the blame matrix of the last round.
#[derive(Debug)]
pub struct ReturnState<S: Scheme> {
    pub success: bool,
    pub session: SessionIdentifier,
    /// The phase the machine was in when the run ended.
    pub phase: Phase,
    pub error: Option<ProtocolError>,
    pub blame: Option<Matrix<S>>,
    pub transaction: Option<S::Transaction>,
    pub output_key: Option<S::SigningKey>,
}

impl<S: Scheme> ReturnState<S> {
    pub(crate) fn failure(session: SessionIdentifier, phase: Phase, error: ProtocolError) -> Self {
        Self {
            success: false,
            session,
            phase,
            error: Some(error),
            blame: None,
            transaction: None,
            output_key: None,
        }
    }

    pub(crate) fn blamed(session: SessionIdentifier, matrix: Matrix<S>) -> Self {
        Self {
            success: false,
            session,
            phase: Phase::Blame,
            error: None,
            blame: Some(matrix),
            transaction: None,
            output_key: None,
        }
    }
}
