//! This module holds some utilities for working with the players of a round.
//!
//! Players are numbered from 1 to N in ascending order of their verification
//! keys, and most of the protocol is phrased in terms of these numbers.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::crypto::{Scheme, VerificationKey};
use crate::message::Message;

/// Represents a sorted list of players.
///
/// Everybody agrees on the order, so this can be hashed to check that
/// all the peers are running the same round.
#[derive(Debug, Clone, Serialize)]
#[serde(bound = "")]
pub struct ParticipantList<S: Scheme> {
    participants: Vec<S::VerificationKey>,
    /// This maps each player to their position in the vector above.
    #[serde(skip_serializing)]
    indices: HashMap<S::VerificationKey, usize>,
}

impl<S: Scheme> ParticipantList<S> {
    /// Create a player list from a slice of keys.
    ///
    /// This will return None if the keys have duplicates.
    pub fn new(participants: &[S::VerificationKey]) -> Option<Self> {
        let mut out = participants.to_owned();
        out.sort();

        let indices: HashMap<_, _> = out
            .iter()
            .enumerate()
            .map(|(i, x)| (x.clone(), i))
            .collect();

        if indices.len() < out.len() {
            return None;
        }

        Some(Self {
            participants: out,
            indices,
        })
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn contains(&self, player: &S::VerificationKey) -> bool {
        self.indices.contains_key(player)
    }

    /// Return the number of a player, starting at 1.
    pub fn index(&self, player: &S::VerificationKey) -> Option<usize> {
        self.indices.get(player).map(|i| i + 1)
    }

    /// Return the player with a given number, starting at 1.
    pub fn get(&self, i: usize) -> Option<&S::VerificationKey> {
        i.checked_sub(1).and_then(|i| self.participants.get(i))
    }

    /// The player with the highest number, who broadcasts the output.
    pub fn last(&self) -> &S::VerificationKey {
        // Lists are never built empty, since they always contain the local player.
        &self.participants[self.participants.len() - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &S::VerificationKey> {
        self.participants.iter()
    }

    /// Iterate over the other players.
    pub fn others<'a>(
        &'a self,
        me: &'a S::VerificationKey,
    ) -> impl Iterator<Item = &'a S::VerificationKey> + 'a {
        self.participants.iter().filter(move |x| *x != me)
    }

    /// The players numbered from `first` to `last`, bounds included.
    ///
    /// The bounds are clamped to the players that actually exist.
    pub fn player_set(&self, first: usize, last: usize) -> BTreeSet<S::VerificationKey> {
        let first = first.max(1);
        let last = last.min(self.len());
        (first..=last)
            .filter_map(|i| self.get(i).cloned())
            .collect()
    }

    /// The list without some players, or None if nobody would be left.
    pub fn without(&self, eliminated: &BTreeSet<S::VerificationKey>) -> Option<Self> {
        let remaining: Vec<_> = self
            .participants
            .iter()
            .filter(|x| !eliminated.contains(*x))
            .cloned()
            .collect();
        if remaining.is_empty() {
            return None;
        }
        Self::new(&remaining)
    }

    /// A message holding the address of every player, in order.
    pub fn addresses(&self) -> Message<S> {
        self.participants.iter().map(|x| x.address()).collect()
    }
}
