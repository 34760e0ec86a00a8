use serde::{de::DeserializeOwned, Serialize};

use crate::crypto::{Scheme, SigningKey, VerificationKey};

/// Encode an arbitrary serializable value into a vec.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Vec<u8> {
    rmp_serde::encode::to_vec(val).expect("failed to encode value")
}

/// Decode an arbitrary value from a slice of bytes.
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}

/// Sign the canonical encoding of a value.
pub fn sign_value<S: Scheme, T: Serialize + ?Sized>(sk: &S::SigningKey, val: &T) -> S::Signature {
    sk.sign(&encode(val))
}

/// Check a signature over the canonical encoding of a value.
pub fn verify_value<S: Scheme, T: Serialize + ?Sized>(
    vk: &S::VerificationKey,
    val: &T,
    signature: &S::Signature,
) -> bool {
    vk.verify(&encode(val), signature)
}
