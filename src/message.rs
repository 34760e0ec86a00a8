//! Messages are the payload of every packet exchanged in the protocol.
//!
//! A message is just a sequence of atoms, each of which is one of the values
//! the protocol needs to pass around. Messages are built by attaching atoms
//! to the back, and consumed by reading atoms off the front.
use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blame::Blame;
use crate::crypto::Scheme;

/// The kind of an atom, used for reporting read errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomKind {
    Address,
    EncryptionKey,
    Signature,
    Hash,
    Blame,
}

impl fmt::Display for AtomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AtomKind::Address => "address",
            AtomKind::EncryptionKey => "encryption key",
            AtomKind::Signature => "signature",
            AtomKind::Hash => "hash",
            AtomKind::Blame => "blame",
        };
        write!(f, "{}", name)
    }
}

/// An error raised when a message doesn't have the shape we expect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("message ended while reading {0}")]
    EndOfMessage(AtomKind),
    #[error("expected {expected}, found {found}")]
    UnexpectedAtom { expected: AtomKind, found: AtomKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Atom<S: Scheme> {
    Address(S::Address),
    EncryptionKey(S::EncryptionKey),
    Signature(S::Signature),
    Hash(S::Digest),
    Blame(Box<Blame<S>>),
}

impl<S: Scheme> Atom<S> {
    pub fn kind(&self) -> AtomKind {
        match self {
            Atom::Address(_) => AtomKind::Address,
            Atom::EncryptionKey(_) => AtomKind::EncryptionKey,
            Atom::Signature(_) => AtomKind::Signature,
            Atom::Hash(_) => AtomKind::Hash,
            Atom::Blame(_) => AtomKind::Blame,
        }
    }
}

/// An ordered sequence of atoms.
///
/// Equality is structural: two messages are equal when they hold the same
/// atoms in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Message<S: Scheme> {
    atoms: VecDeque<Atom<S>>,
}

impl<S: Scheme> Default for Message<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scheme> Message<S> {
    pub fn new() -> Self {
        Self {
            atoms: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn atoms(&self) -> impl Iterator<Item = &Atom<S>> {
        self.atoms.iter()
    }

    pub fn attach(&mut self, atom: Atom<S>) -> &mut Self {
        self.atoms.push_back(atom);
        self
    }

    pub fn attach_address(&mut self, address: S::Address) -> &mut Self {
        self.attach(Atom::Address(address))
    }

    pub fn attach_encryption_key(&mut self, key: S::EncryptionKey) -> &mut Self {
        self.attach(Atom::EncryptionKey(key))
    }

    pub fn attach_signature(&mut self, signature: S::Signature) -> &mut Self {
        self.attach(Atom::Signature(signature))
    }

    pub fn attach_hash(&mut self, digest: S::Digest) -> &mut Self {
        self.attach(Atom::Hash(digest))
    }

    pub fn attach_blame(&mut self, blame: Blame<S>) -> &mut Self {
        self.attach(Atom::Blame(Box::new(blame)))
    }

    /// Read the next atom off the front, whatever it is.
    pub fn read(&mut self) -> Option<Atom<S>> {
        self.atoms.pop_front()
    }

    /// Read an atom of a given kind off the front.
    ///
    /// On a kind mismatch the atom is left in place.
    fn read_kind<T>(
        &mut self,
        expected: AtomKind,
        extract: impl FnOnce(Atom<S>) -> Result<T, Atom<S>>,
    ) -> Result<T, FormatError> {
        let atom = self
            .atoms
            .pop_front()
            .ok_or(FormatError::EndOfMessage(expected))?;
        let found = atom.kind();
        extract(atom).map_err(|atom| {
            self.atoms.push_front(atom);
            FormatError::UnexpectedAtom { expected, found }
        })
    }

    pub fn read_address(&mut self) -> Result<S::Address, FormatError> {
        self.read_kind(AtomKind::Address, |atom| match atom {
            Atom::Address(x) => Ok(x),
            other => Err(other),
        })
    }

    pub fn read_encryption_key(&mut self) -> Result<S::EncryptionKey, FormatError> {
        self.read_kind(AtomKind::EncryptionKey, |atom| match atom {
            Atom::EncryptionKey(x) => Ok(x),
            other => Err(other),
        })
    }

    pub fn read_signature(&mut self) -> Result<S::Signature, FormatError> {
        self.read_kind(AtomKind::Signature, |atom| match atom {
            Atom::Signature(x) => Ok(x),
            other => Err(other),
        })
    }

    pub fn read_hash(&mut self) -> Result<S::Digest, FormatError> {
        self.read_kind(AtomKind::Hash, |atom| match atom {
            Atom::Hash(x) => Ok(x),
            other => Err(other),
        })
    }

    pub fn read_blame(&mut self) -> Result<Blame<S>, FormatError> {
        self.read_kind(AtomKind::Blame, |atom| match atom {
            Atom::Blame(x) => Ok(*x),
            other => Err(other),
        })
    }

    /// Read every remaining atom as an address.
    pub fn read_addresses(&mut self) -> Result<Vec<S::Address>, FormatError> {
        let mut out = Vec::with_capacity(self.len());
        while !self.is_empty() {
            out.push(self.read_address()?);
        }
        Ok(out)
    }
}

impl<S: Scheme> FromIterator<S::Address> for Message<S> {
    fn from_iter<I: IntoIterator<Item = S::Address>>(iter: I) -> Self {
        Self {
            atoms: iter.into_iter().map(Atom::Address).collect(),
        }
    }
}

/// Check whether all of the messages are equal to each other.
///
/// This is trivially true for zero or one messages.
pub fn are_equal<'a, S: Scheme>(messages: impl IntoIterator<Item = &'a Message<S>>) -> bool {
    let mut messages = messages.into_iter();
    match messages.next() {
        None => true,
        Some(first) => messages.all(|m| m == first),
    }
}
