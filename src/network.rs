use thiserror::Error;

use crate::crypto::Scheme;
use crate::packet::SignedPacket;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connection closed")]
    Closed,
    #[error("unknown peer")]
    UnknownPeer,
    #[error("network failure: {0}")]
    Other(String),
}

/// Point to point delivery of packets between peers.
///
/// Packets are signed by the protocol itself, so the transport doesn't
/// need to authenticate anything. It may drop, delay, or reorder packets.
#[allow(async_fn_in_trait)]
pub trait Network<S: Scheme> {
    async fn send_to(
        &self,
        to: &S::VerificationKey,
        packet: SignedPacket<S>,
    ) -> Result<(), NetworkError>;

    /// Wait for the next packet addressed to us.
    async fn receive(&self) -> Result<SignedPacket<S>, NetworkError>;
}
