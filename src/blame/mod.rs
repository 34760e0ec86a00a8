//! Blame is how a round that went wrong ends.
//!
//! Every peer which notices a deviation broadcasts a [Blame] record,
//! carrying whatever evidence it has. Each peer then checks the records it
//! received against what it saw itself, and fills in a [Matrix] of who
//! accuses whom, and whether that accusation holds up.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::Scheme;
use crate::packet::SignedPacket;

pub(crate) mod engine;
mod matrix;

pub use matrix::{Artifact, Evidence, Matrix};

/// The reasons for which a peer can be accused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reason {
    InsufficientFunds,
    NoFundsAtAll,
    DoubleSpend,
    EquivocationFailure,
    /// An announcer sent different encryption keys to different peers.
    EquivocationFailureAnnouncement,
    /// The last player sent different output lists to different peers.
    EquivocationFailureBroadcast,
    ShuffleFailure,
    ShuffleAndEquivocationFailure,
    InvalidSignature,
    MissingOutput,
    /// The accused sent a blame record with missing or bogus evidence.
    MalformedBlame,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A blame record, as sent in a blame packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Blame<S: Scheme> {
    NoFundsAtAll {
        accused: S::VerificationKey,
    },
    InsufficientFunds {
        accused: S::VerificationKey,
        transaction: Option<S::Transaction>,
    },
    DoubleSpend {
        accused: S::VerificationKey,
        transaction: Option<S::Transaction>,
    },
    /// The announcement and output packets we received, showing that
    /// somebody sent different things to different peers.
    EquivocationFailure { evidence: Vec<SignedPacket<S>> },
    /// Announces that the shuffle failed for us, conclusive evidence follows.
    ShuffleFailure,
    /// Our decryption key, along with the shuffle and output packets we
    /// received, so that everyone can replay the shuffle.
    ShuffleAndEquivocationFailure {
        key: Option<S::DecryptionKey>,
        evidence: Vec<SignedPacket<S>>,
    },
    InvalidSignature {
        signatures: Option<BTreeMap<S::VerificationKey, S::Signature>>,
    },
    /// Our output address is missing from the list the last player broadcast.
    MissingOutput { accused: S::VerificationKey },
}

impl<S: Scheme> Blame<S> {
    pub fn reason(&self) -> Reason {
        match self {
            Blame::NoFundsAtAll { .. } => Reason::NoFundsAtAll,
            Blame::InsufficientFunds { .. } => Reason::InsufficientFunds,
            Blame::DoubleSpend { .. } => Reason::DoubleSpend,
            Blame::EquivocationFailure { .. } => Reason::EquivocationFailure,
            Blame::ShuffleFailure => Reason::ShuffleFailure,
            Blame::ShuffleAndEquivocationFailure { .. } => Reason::ShuffleAndEquivocationFailure,
            Blame::InvalidSignature { .. } => Reason::InvalidSignature,
            Blame::MissingOutput { .. } => Reason::MissingOutput,
        }
    }

    /// Markers announce a shuffle problem, and are followed by a second
    /// blame message holding the actual evidence.
    pub fn is_marker(&self) -> bool {
        matches!(self, Blame::ShuffleFailure | Blame::MissingOutput { .. })
    }
}
