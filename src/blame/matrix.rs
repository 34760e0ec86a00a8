use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::Reason;
use crate::crypto::Scheme;
use crate::packet::SignedPacket;

/// Something backing up an accusation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Artifact<S: Scheme> {
    Transaction(S::Transaction),
    Signature(S::Signature),
    /// The differing output packets sent by the last player.
    Outputs(Vec<SignedPacket<S>>),
    /// The encryption key an announcer sent to each peer.
    Keys(BTreeMap<S::VerificationKey, S::EncryptionKey>),
}

/// A single accusation.
///
/// `credible` records whether we could confirm the accusation ourselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Evidence<S: Scheme> {
    pub reason: Reason,
    pub credible: bool,
    pub artifact: Option<Artifact<S>>,
}

impl<S: Scheme> Evidence<S> {
    pub fn new(reason: Reason, credible: bool) -> Self {
        Self {
            reason,
            credible,
            artifact: None,
        }
    }

    pub fn with_artifact(reason: Reason, credible: bool, artifact: Artifact<S>) -> Self {
        Self {
            reason,
            credible,
            artifact: Some(artifact),
        }
    }

    /// Whether this evidence fits a pattern.
    ///
    /// A pattern without an artifact matches any artifact.
    fn fits(&self, pattern: &Self) -> bool {
        self.reason == pattern.reason
            && self.credible == pattern.credible
            && (pattern.artifact.is_none() || self.artifact == pattern.artifact)
    }
}

/// Who accuses whom, and on what grounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Matrix<S: Scheme> {
    blame: BTreeMap<S::VerificationKey, BTreeMap<S::VerificationKey, Vec<Evidence<S>>>>,
}

impl<S: Scheme> Default for Matrix<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scheme> Matrix<S> {
    pub fn new() -> Self {
        Self {
            blame: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blame.is_empty()
    }

    /// Record an accusation.
    ///
    /// Recording the same evidence twice has no effect.
    pub fn put(
        &mut self,
        accuser: &S::VerificationKey,
        accused: &S::VerificationKey,
        evidence: Evidence<S>,
    ) {
        let entries = self
            .blame
            .entry(accuser.clone())
            .or_default()
            .entry(accused.clone())
            .or_default();
        if !entries.contains(&evidence) {
            entries.push(evidence);
        }
    }

    pub fn get(
        &self,
        accuser: &S::VerificationKey,
        accused: &S::VerificationKey,
    ) -> &[Evidence<S>] {
        self.blame
            .get(accuser)
            .and_then(|row| row.get(accused))
            .map(|x| x.as_slice())
            .unwrap_or(&[])
    }

    pub fn blame_exists(
        &self,
        accuser: &S::VerificationKey,
        accused: &S::VerificationKey,
        reason: Reason,
    ) -> bool {
        self.get(accuser, accused).iter().any(|e| e.reason == reason)
    }

    pub fn accuses(&self, accuser: &S::VerificationKey, accused: &S::VerificationKey) -> bool {
        !self.get(accuser, accused).is_empty()
    }

    pub fn credibly_accuses(
        &self,
        accuser: &S::VerificationKey,
        accused: &S::VerificationKey,
    ) -> bool {
        self.get(accuser, accused).iter().any(|e| e.credible)
    }

    /// Iterate over every accusation, as (accuser, accused, evidence).
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&S::VerificationKey, &S::VerificationKey, &Evidence<S>)> {
        self.blame.iter().flat_map(|(accuser, row)| {
            row.iter().flat_map(move |(accused, entries)| {
                entries.iter().map(move |e| (accuser, accused, e))
            })
        })
    }

    /// Check that every accusation in `pattern` also appears here.
    pub fn matches(&self, pattern: &Self) -> bool {
        pattern.iter().all(|(accuser, accused, wanted)| {
            self.get(accuser, accused).iter().any(|e| e.fits(wanted))
        })
    }

    /// Decide which players should be removed from the next round.
    ///
    /// A player looks honest if nobody credibly accuses them. A player is
    /// indicted if some non-empty group of honest looking players all
    /// credibly accuse them, with no accusations inside of that group.
    pub fn indicted<'a>(
        &self,
        players: impl IntoIterator<Item = &'a S::VerificationKey>,
    ) -> BTreeSet<S::VerificationKey> {
        let players: Vec<&S::VerificationKey> = players.into_iter().collect();
        let honest: Vec<&S::VerificationKey> = players
            .iter()
            .copied()
            .filter(|q| !players.iter().any(|a| self.credibly_accuses(a, q)))
            .collect();

        let mut out = BTreeSet::new();
        for p in players.iter().copied() {
            let mut group: Vec<&S::VerificationKey> = Vec::new();
            for q in honest.iter().copied() {
                if q == p || !self.credibly_accuses(q, p) {
                    continue;
                }
                if group
                    .iter()
                    .all(|r| !self.accuses(q, r) && !self.accuses(r, q))
                {
                    group.push(q);
                }
            }
            if !group.is_empty() {
                out.insert(p.clone());
            }
        }
        out
    }
}
