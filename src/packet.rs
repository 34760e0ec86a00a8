use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{Scheme, VerificationKey};
use crate::message::Message;
use crate::protocol::Phase;
use crate::serde::{sign_value, verify_value};

/// Identifies a shuffle, agreed upon by every peer before the protocol starts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionIdentifier(String);

impl SessionIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit sent over the network.
///
/// `round` counts the attempts made in this session, starting at 0, so that
/// packets left over from an earlier attempt can't leak into a later one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Packet<S: Scheme> {
    pub message: Message<S>,
    pub session: SessionIdentifier,
    pub round: u32,
    pub phase: Phase,
    pub signer: S::VerificationKey,
    pub recipient: S::VerificationKey,
}

impl<S: Scheme> Packet<S> {
    pub fn sign(self, sk: &S::SigningKey) -> SignedPacket<S> {
        let signature = sign_value::<S, _>(sk, &self);
        SignedPacket {
            packet: self,
            signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SignedPacket<S: Scheme> {
    pub packet: Packet<S>,
    pub signature: S::Signature,
}

impl<S: Scheme> SignedPacket<S> {
    /// Check that the packet was signed by the key it names as signer.
    pub fn verify(&self) -> bool {
        verify_value::<S, _>(&self.packet.signer, &self.packet, &self.signature)
    }

    pub fn signer(&self) -> &S::VerificationKey {
        &self.packet.signer
    }
}
