use std::{fmt::Debug, hash::Hash};

use rand_core::CryptoRngCore;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::message::Message;
use crate::serde::encode;

const HASH_LABEL: &[u8] = b"coinshuffle v0.1.0 message hash";

/// An error raised by one of the key operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptographyError {
    #[error("address was not encrypted under this key")]
    WrongKey,
    #[error("address is not encrypted")]
    NotEncrypted,
    #[error("key operation failed: {0}")]
    Other(String),
}

/// Represents the family of primitives the protocol runs over.
///
/// The protocol never looks inside any of these types, it only needs to move them
/// around, compare them, and feed them to the operations on the key traits below.
/// Implementing this trait (and the key traits) for a concrete signature scheme,
/// encryption scheme, and cryptocurrency is all that's needed to run a shuffle.
///
/// The bounds on `Self` are there so that the generic containers in this crate
/// can use the standard derives; implementors are expected to be unit structs.
pub trait Scheme: Clone + Copy + Debug + PartialEq + Eq + Send + Sync + 'static {
    /// An address in the cryptocurrency, possibly wrapped in layers of encryption.
    type Address: Clone + Debug + Eq + Ord + Hash + Serialize + DeserializeOwned;
    type Signature: Clone + Debug + Eq + Serialize + DeserializeOwned;
    /// The output of the hash function.
    type Digest: Clone + Debug + Eq + Serialize + DeserializeOwned;
    type Transaction: Clone + Debug + Eq + Serialize + DeserializeOwned;

    type VerificationKey: VerificationKey<Self>;
    type SigningKey: SigningKey<Self>;
    type EncryptionKey: EncryptionKey<Self>;
    type DecryptionKey: DecryptionKey<Self>;
}

/// The public identity of a peer.
///
/// The ordering on keys decides the order in which peers take part in a round.
pub trait VerificationKey<S: Scheme>:
    Clone + Debug + Eq + Ord + Hash + Serialize + DeserializeOwned
{
    /// The address holding the funds this key controls.
    fn address(&self) -> S::Address;

    fn verify(&self, data: &[u8], signature: &S::Signature) -> bool;
}

pub trait SigningKey<S: Scheme>: Debug {
    fn verification_key(&self) -> S::VerificationKey;

    fn sign(&self, data: &[u8]) -> S::Signature;
}

pub trait EncryptionKey<S: Scheme>: Clone + Debug + Eq + Serialize + DeserializeOwned {
    /// Wrap an address in one more layer of encryption.
    fn encrypt(&self, address: &S::Address) -> S::Address;
}

pub trait DecryptionKey<S: Scheme>: Clone + Debug + Eq + Serialize + DeserializeOwned {
    fn encryption_key(&self) -> S::EncryptionKey;

    /// Peel the outermost layer of encryption off an address.
    fn decrypt(&self, address: &S::Address) -> Result<S::Address, CryptographyError>;
}

/// The cryptographic capabilities a peer needs.
pub trait Crypto<S: Scheme> {
    fn make_signing_key(&self) -> S::SigningKey;

    fn make_decryption_key(&self) -> S::DecryptionKey;

    /// Hash arbitrary bytes.
    fn digest(&self, data: &[u8]) -> S::Digest;

    /// Return a uniformly random integer in `[0, n]`, bounds included.
    fn get_random(&self, n: usize) -> usize;

    /// Hash a message, returning a message containing only the digest.
    fn hash(&self, message: &Message<S>) -> Message<S> {
        let mut data = HASH_LABEL.to_vec();
        data.extend_from_slice(&encode(message));
        let mut out = Message::new();
        out.attach_hash(self.digest(&data));
        out
    }
}

/// Sample a uniform integer in `[0, n]` by rejection.
///
/// This is a convenient way to implement [Crypto::get_random] on top of a
/// cryptographic rng.
pub fn random_inclusive(rng: &mut impl CryptoRngCore, n: usize) -> usize {
    let n = n as u64;
    if n == u64::MAX {
        return rng.next_u64() as usize;
    }
    let range = n + 1;
    // The largest multiple of range that fits, so that the modulo is unbiased.
    let zone = range * (u64::MAX / range);
    loop {
        let x = rng.next_u64();
        if x < zone {
            return (x % range) as usize;
        }
    }
}
