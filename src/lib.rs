//! An implementation of the CoinShuffle mixing protocol.
//!
//! CoinShuffle lets a group of peers, each holding some coins, move the same
//! amount of coins into fresh addresses with a single joint transaction,
//! without anyone learning which new address belongs to which peer.
//!
//! # Warning
//!
//! This library has not undergone any form of audit.
//!
//! # Design
//!
//! The protocol never depends on a concrete cryptocurrency or cryptosystem.
//! Instead, everything is generic over a [Scheme], which names the types of
//! addresses, keys, signatures and transactions, and the code reaches the
//! outside world through three capabilities:
//!
//! - [Crypto], for generating keys, hashing, and randomness,
//! - [Coin], for looking at the cryptocurrency and publishing transactions,
//! - [Network], for exchanging signed packets with the other peers.
//!
//! A shuffle goes through a sequence of [Phase]s. First, every peer announces
//! a fresh encryption key. Then each peer in turn decrypts the list of onions
//! it receives, adds its own new address, wrapped in the keys of the peers
//! after it, and shuffles the list. The last peer publishes the final list,
//! the peers check that nobody was sent different keys, and finally
//! everybody signs the joint transaction.
//!
//! If anything goes wrong, the peers exchange evidence in a blame phase, and
//! build a [Matrix] of who accuses whom. The peers found to have misbehaved
//! are removed, and the shuffle starts over with whoever is left.
//!
//! ## API Design
//!
//! A single shuffle is driven by a [ShuffleMachine], built from
//! [ShuffleArguments] and a [Config]. Running the machine returns a
//! [ReturnState], which holds either the published transaction and the key
//! for our new address, or the error or blame explaining the failure.
//! The phase of a running machine can be observed through a [Monitor].
//!
//! The [shuffle] function wraps all of this up into a single call.
mod blame;
mod coin;
mod config;
mod crypto;
mod machine;
mod message;
mod network;
mod packet;
mod participants;
mod protocol;
mod round;
mod serde;
mod shuffle;

#[cfg(test)]
mod mock;

use tracing::debug;

pub use blame::{Artifact, Blame, Evidence, Matrix, Reason};
pub use coin::{Coin, CoinNetworkError};
pub use config::Config;
pub use crypto::{
    random_inclusive, Crypto, CryptographyError, DecryptionKey, EncryptionKey, Scheme,
    SigningKey, VerificationKey,
};
pub use machine::{ShuffleArguments, ShuffleMachine};
pub use message::{are_equal, Atom, AtomKind, FormatError, Message};
pub use network::{Network, NetworkError};
pub use packet::{Packet, SessionIdentifier, SignedPacket};
pub use protocol::{InitializationError, Monitor, Phase, ProtocolError, ReturnState};

/// Take part in a shuffle.
///
/// When `observer` is given, a [Monitor] for the shuffle is sent on it before
/// the shuffle starts.
pub async fn shuffle<S, C, K, N>(
    args: ShuffleArguments<S>,
    config: Config,
    crypto: C,
    coin: K,
    network: N,
    observer: Option<smol::channel::Sender<Monitor>>,
) -> Result<ReturnState<S>, ProtocolError>
where
    S: Scheme,
    C: Crypto<S>,
    K: Coin<S>,
    N: Network<S>,
{
    let mut machine = ShuffleMachine::new(args, config, crypto, coin, network)
        .map_err(|e| ProtocolError::Value(e.to_string()))?;
    if let Some(observer) = observer {
        if observer.send(machine.monitor()).await.is_err() {
            debug!("nobody is listening for the monitor");
        }
    }
    machine.run().await
}
