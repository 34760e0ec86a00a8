//! The onion and permutation steps of the shuffling phase.
use std::collections::{BTreeSet, VecDeque};

use crate::crypto::{Crypto, CryptographyError, DecryptionKey, EncryptionKey, Scheme};

/// Randomly permute a list, driven by [Crypto::get_random].
///
/// This is Fisher-Yates: at step `i`, counting down from the length of the list
/// to 1, we draw `n` in `[0, i - 1]` and move the `n`-th remaining element to the
/// output. Every random tape of draws gives a different permutation.
pub fn shuffle<S: Scheme, T>(crypto: &impl Crypto<S>, items: Vec<T>) -> Vec<T> {
    let mut queue: VecDeque<T> = items.into();
    let mut out = Vec::with_capacity(queue.len());
    for i in (1..=queue.len()).rev() {
        let n = crypto.get_random(i - 1);
        // Out of range draws still produce a permutation.
        queue.rotate_left(n % i);
        if let Some(x) = queue.pop_front() {
            out.push(x);
        }
    }
    out
}

/// Encrypt an address under a stack of keys.
///
/// The keys are applied from last to first, so the first key in the list ends
/// up as the outermost layer.
pub fn encrypt_layered<'a, S: Scheme>(
    address: &S::Address,
    keys: impl DoubleEndedIterator<Item = &'a S::EncryptionKey>,
) -> S::Address {
    keys.rev().fold(address.clone(), |acc, ek| ek.encrypt(&acc))
}

/// Why a list of onions couldn't be peeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeelError {
    /// Some ciphertext appears twice, or failed to decrypt.
    Shuffle(Option<CryptographyError>),
    /// The list doesn't have as many entries as there are players before us.
    Count { expected: usize, found: usize },
}

/// Remove our layer from every onion we were handed.
pub fn decrypt_all<S: Scheme>(
    dk: &S::DecryptionKey,
    onions: &[S::Address],
    expected: usize,
) -> Result<Vec<S::Address>, PeelError> {
    let distinct: BTreeSet<_> = onions.iter().collect();
    if distinct.len() != onions.len() {
        return Err(PeelError::Shuffle(None));
    }
    if onions.len() != expected {
        return Err(PeelError::Count {
            expected,
            found: onions.len(),
        });
    }
    onions
        .iter()
        .map(|x| dk.decrypt(x).map_err(|e| PeelError::Shuffle(Some(e))))
        .collect()
}
