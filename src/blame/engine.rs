use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::{Artifact, Blame, Evidence, Matrix, Reason};
use crate::coin::Coin;
use crate::crypto::{Crypto, DecryptionKey, Scheme, VerificationKey};
use crate::message::{are_equal, Message};
use crate::packet::{Packet, SessionIdentifier, SignedPacket};
use crate::participants::ParticipantList;
use crate::protocol::{Phase, ProtocolError};
use crate::serde::verify_value;

/// What the peers reported seeing during the round.
struct History<S: Scheme> {
    /// The output packet the last player sent to each peer.
    outputs: BTreeMap<S::VerificationKey, SignedPacket<S>>,
    /// The encryption key each announcer sent to each peer.
    sent_keys: BTreeMap<S::VerificationKey, BTreeMap<S::VerificationKey, S::EncryptionKey>>,
    /// The shuffle message each peer received from the player before it.
    shuffle_messages: BTreeMap<S::VerificationKey, Message<S>>,
    decryption_keys: BTreeMap<S::VerificationKey, S::DecryptionKey>,
}

impl<S: Scheme> History<S> {
    fn new() -> Self {
        Self {
            outputs: BTreeMap::new(),
            sent_keys: BTreeMap::new(),
            shuffle_messages: BTreeMap::new(),
            decryption_keys: BTreeMap::new(),
        }
    }
}

/// Turns the blame packets of a round into accusations.
///
/// Each blame record is checked against what we saw ourselves, and the
/// evidence attached to the records is combined to catch the peers who
/// sent different things to different people, or who broke the shuffle.
pub(crate) struct BlameEngine<'a, S: Scheme, C: Crypto<S>, K: Coin<S>> {
    pub me: &'a S::VerificationKey,
    pub players: &'a ParticipantList<S>,
    pub session: &'a SessionIdentifier,
    pub round: u32,
    pub amount: u64,
    pub coin: &'a K,
    pub crypto: &'a C,
    /// The encryption keys announced to us.
    pub encryption_keys: &'a BTreeMap<S::VerificationKey, S::EncryptionKey>,
    /// Our shuffle transaction, if we got as far as building it.
    pub transaction: Option<&'a S::Transaction>,
    /// The equivocation check hash each peer sent us.
    pub hashes: BTreeMap<S::VerificationKey, Message<S>>,
}

impl<'a, S: Scheme, C: Crypto<S>, K: Coin<S>> BlameEngine<'a, S, C, K> {
    fn malformed(&self, matrix: &mut Matrix<S>, from: &S::VerificationKey) {
        if from == self.me {
            return;
        }
        warn!(peer = ?from, "malformed blame");
        matrix.put(self.me, from, Evidence::new(Reason::MalformedBlame, true));
    }

    /// Fill in the matrix with the blame packets received in this round.
    pub async fn fill(
        &self,
        matrix: &mut Matrix<S>,
        received: &BTreeMap<S::VerificationKey, Vec<Packet<S>>>,
    ) -> Result<(), ProtocolError> {
        let mut history = History::new();
        for (from, packets) in received {
            for packet in packets {
                let mut message = packet.message.clone();
                while !message.is_empty() {
                    match message.read_blame() {
                        Ok(blame) => {
                            self.dispatch(matrix, &mut history, from, blame).await?;
                        }
                        Err(e) => {
                            debug!(peer = ?from, error = %e, "blame packet holds something else");
                            self.malformed(matrix, from);
                            break;
                        }
                    }
                }
            }
        }

        self.check_outputs(matrix, &history);
        self.check_announcements(matrix, &history);
        self.replay_shuffle(matrix, &history);
        Ok(())
    }

    async fn dispatch(
        &self,
        matrix: &mut Matrix<S>,
        history: &mut History<S>,
        from: &S::VerificationKey,
        blame: Blame<S>,
    ) -> Result<(), ProtocolError> {
        let mine = from == self.me;
        match blame {
            Blame::NoFundsAtAll { accused } => {
                if mine {
                    return Ok(());
                }
                let credible = matrix.blame_exists(self.me, &accused, Reason::NoFundsAtAll);
                matrix.put(from, &accused, Evidence::new(Reason::NoFundsAtAll, credible));
            }
            Blame::InsufficientFunds {
                accused,
                transaction,
            } => {
                if mine {
                    return Ok(());
                }
                let Some(transaction) = transaction else {
                    self.malformed(matrix, from);
                    return Ok(());
                };
                let credible = self
                    .coin
                    .spends_from(&accused.address(), self.amount, &transaction)
                    .await?;
                matrix.put(
                    from,
                    &accused,
                    Evidence::with_artifact(
                        Reason::InsufficientFunds,
                        credible,
                        Artifact::Transaction(transaction),
                    ),
                );
            }
            Blame::DoubleSpend {
                accused,
                transaction,
            } => {
                if mine {
                    return Ok(());
                }
                let Some(transaction) = transaction else {
                    self.malformed(matrix, from);
                    return Ok(());
                };
                let credible = self
                    .coin
                    .spends_from(&accused.address(), self.amount, &transaction)
                    .await?;
                matrix.put(
                    from,
                    &accused,
                    Evidence::with_artifact(
                        Reason::DoubleSpend,
                        credible,
                        Artifact::Transaction(transaction),
                    ),
                );
            }
            Blame::InvalidSignature { signatures } => {
                if mine {
                    return Ok(());
                }
                let Some(signatures) = signatures else {
                    self.malformed(matrix, from);
                    return Ok(());
                };
                for (accused, signature) in signatures {
                    // Without a transaction of our own, we can't tell who is right.
                    let credible = self.transaction.map_or(false, |t| {
                        !verify_value::<S, _>(&accused, t, &signature)
                    });
                    matrix.put(
                        from,
                        &accused,
                        Evidence::with_artifact(
                            Reason::InvalidSignature,
                            credible,
                            Artifact::Signature(signature),
                        ),
                    );
                }
            }
            Blame::EquivocationFailure { evidence } => {
                let received = self.collect_history(matrix, history, from, &evidence);
                if !mine {
                    self.check_hash(matrix, from, &received);
                }
            }
            Blame::ShuffleAndEquivocationFailure { key, evidence } => {
                match key {
                    Some(dk) => self.record_key(matrix, history, from, dk),
                    None => {
                        if self.players.index(from).unwrap_or(0) > 1 {
                            self.malformed(matrix, from);
                        }
                    }
                }
                self.collect_history(matrix, history, from, &evidence);
            }
            // Markers only announce the conclusive packet which follows them.
            Blame::ShuffleFailure | Blame::MissingOutput { .. } => {}
        }
        Ok(())
    }

    fn record_key(
        &self,
        matrix: &mut Matrix<S>,
        history: &mut History<S>,
        from: &S::VerificationKey,
        dk: S::DecryptionKey,
    ) {
        if self.encryption_keys.get(from) != Some(&dk.encryption_key()) {
            self.malformed(matrix, from);
            return;
        }
        match history.decryption_keys.get(from) {
            Some(previous) if *previous != dk => self.malformed(matrix, from),
            _ => {
                history.decryption_keys.insert(from.clone(), dk);
            }
        }
    }

    /// Check that `from` really did see different keys, by recomputing the
    /// hash it sent out of the announcements it forwarded.
    fn check_hash(
        &self,
        matrix: &mut Matrix<S>,
        from: &S::VerificationKey,
        received: &BTreeMap<S::VerificationKey, S::EncryptionKey>,
    ) {
        let Some(sent) = self.hashes.get(from) else {
            debug!(peer = ?from, "no hash to compare the evidence with");
            return;
        };
        let mut keys = Message::new();
        for player in self.players.iter().skip(1) {
            let key = if player == from {
                self.encryption_keys.get(from)
            } else {
                received.get(player)
            };
            match key {
                Some(key) => {
                    keys.attach_encryption_key(key.clone());
                }
                None => {
                    self.malformed(matrix, from);
                    return;
                }
            }
        }
        if self.crypto.hash(&keys) != *sent {
            self.malformed(matrix, from);
        }
    }

    /// Sort the packets a peer attached to its blame into the history.
    ///
    /// Returns the encryption keys the peer received in announcements.
    fn collect_history(
        &self,
        matrix: &mut Matrix<S>,
        history: &mut History<S>,
        from: &S::VerificationKey,
        evidence: &[SignedPacket<S>],
    ) -> BTreeMap<S::VerificationKey, S::EncryptionKey> {
        let mut received = BTreeMap::new();
        for signed in evidence {
            let packet = &signed.packet;
            let genuine = signed.verify()
                && packet.session == *self.session
                && packet.round == self.round
                && packet.recipient == *from
                && self.players.contains(&packet.signer);
            if !genuine {
                self.malformed(matrix, from);
                continue;
            }
            match packet.phase {
                Phase::Announcement => {
                    let mut message = packet.message.clone();
                    // Player 1 announces no key.
                    if let Ok(key) = message.read_encryption_key() {
                        history
                            .sent_keys
                            .entry(packet.signer.clone())
                            .or_default()
                            .insert(from.clone(), key.clone());
                        received.insert(packet.signer.clone(), key);
                    }
                }
                Phase::Shuffling => {
                    let previous = self
                        .players
                        .index(from)
                        .and_then(|i| i.checked_sub(1))
                        .and_then(|i| self.players.get(i));
                    if previous != Some(&packet.signer) {
                        self.malformed(matrix, from);
                        continue;
                    }
                    match history.shuffle_messages.get(from) {
                        Some(m) if *m != packet.message => self.malformed(matrix, from),
                        Some(_) => {}
                        None => {
                            history
                                .shuffle_messages
                                .insert(from.clone(), packet.message.clone());
                        }
                    }
                }
                Phase::BroadcastOutput => {
                    if packet.signer != *self.players.last() {
                        self.malformed(matrix, from);
                        continue;
                    }
                    match history.outputs.get(from) {
                        Some(p) if p.packet != *packet => self.malformed(matrix, from),
                        Some(_) => {}
                        None => {
                            history.outputs.insert(from.clone(), signed.clone());
                        }
                    }
                }
                _ => self.malformed(matrix, from),
            }
        }
        received
    }

    /// The last player must have sent the same output list to everybody.
    fn check_outputs(&self, matrix: &mut Matrix<S>, history: &History<S>) {
        let messages = history.outputs.values().map(|p| &p.packet.message);
        if are_equal(messages) {
            return;
        }
        let last = self.players.last();
        warn!(peer = ?last, "output list differs between peers");
        let packets = history.outputs.values().cloned().collect();
        matrix.put(
            self.me,
            last,
            Evidence::with_artifact(
                Reason::EquivocationFailureBroadcast,
                true,
                Artifact::Outputs(packets),
            ),
        );
    }

    /// Every announcer must have sent the same key to everybody.
    fn check_announcements(&self, matrix: &mut Matrix<S>, history: &History<S>) {
        for (announcer, sent) in &history.sent_keys {
            let mut sent = sent.clone();
            if announcer != self.me {
                if let Some(key) = self.encryption_keys.get(announcer) {
                    sent.insert(self.me.clone(), key.clone());
                }
            }
            let mut keys = sent.values();
            let Some(first) = keys.next() else {
                continue;
            };
            if keys.all(|k| k == first) {
                continue;
            }
            warn!(peer = ?announcer, "announcer sent different keys to different peers");
            matrix.put(
                self.me,
                announcer,
                Evidence::with_artifact(
                    Reason::EquivocationFailureAnnouncement,
                    true,
                    Artifact::Keys(sent),
                ),
            );
        }
    }

    /// Whether the evidence shows player `i` passing on a shuffle message.
    fn forwarded(&self, history: &History<S>, i: usize) -> bool {
        if i == self.players.len() {
            return !history.outputs.is_empty();
        }
        self.players
            .get(i + 1)
            .map_or(false, |next| history.shuffle_messages.contains_key(next))
    }

    /// Replay the shuffle with the disclosed decryption keys.
    ///
    /// The message received by player `i` must decrypt to `i - 1` distinct
    /// addresses, including every address the player before it received. The
    /// first player whose output breaks this is the one who tampered with the
    /// shuffle. The final list has to hold one more address still.
    fn replay_shuffle(&self, matrix: &mut Matrix<S>, history: &History<S>) {
        if history.decryption_keys.is_empty() {
            return;
        }
        let n = self.players.len();
        let mut keys = Vec::with_capacity(n);
        for player in self.players.iter().skip(1) {
            match history.decryption_keys.get(player) {
                Some(dk) => keys.push(dk),
                None => {
                    debug!(peer = ?player, "missing decryption key, can't replay the shuffle");
                    return;
                }
            }
        }

        let mut previous = BTreeSet::new();
        for i in 2..=n {
            let (Some(sender), Some(receiver)) = (self.players.get(i - 1), self.players.get(i))
            else {
                return;
            };
            let Some(message) = history.shuffle_messages.get(receiver) else {
                // Only the receiver can show what it was sent. If it kept that
                // back but still handed something on, the gap is its own doing.
                if self.forwarded(history, i) {
                    warn!(peer = ?receiver, "withheld the shuffle message it received");
                    matrix.put(self.me, receiver, Evidence::new(Reason::MalformedBlame, true));
                } else {
                    debug!(peer = ?receiver, "no shuffle message to replay");
                }
                return;
            };
            // keys[0] belongs to player 2.
            let valid = match peel::<S>(message, &keys[i - 2..]) {
                Some(addresses) => {
                    let distinct: BTreeSet<_> = addresses.iter().cloned().collect();
                    let ok = addresses.len() == i - 1
                        && distinct.len() == i - 1
                        && distinct.is_superset(&previous);
                    if ok {
                        previous = distinct;
                    }
                    ok
                }
                None => false,
            };
            if !valid {
                warn!(peer = ?sender, player = i - 1, "replay shows the shuffle was broken");
                matrix.put(self.me, sender, Evidence::new(Reason::ShuffleFailure, true));
                return;
            }
        }

        let last = self.players.last();
        for signed in history.outputs.values() {
            let mut message = signed.packet.message.clone();
            let addresses = message.read_addresses().unwrap_or_default();
            let distinct: BTreeSet<_> = addresses.iter().cloned().collect();
            if addresses.len() != n || distinct.len() != n || !distinct.is_superset(&previous) {
                warn!(peer = ?last, "replay shows addresses missing from the output");
                matrix.put(self.me, last, Evidence::new(Reason::MissingOutput, true));
                return;
            }
        }
    }
}

/// Strip every layer off the onions in a message, or None if that fails.
fn peel<S: Scheme>(message: &Message<S>, keys: &[&S::DecryptionKey]) -> Option<Vec<S::Address>> {
    let mut message = message.clone();
    let onions = message.read_addresses().ok()?;
    onions
        .into_iter()
        .map(|onion| {
            keys.iter()
                .try_fold(onion, |acc, dk| dk.decrypt(&acc).ok())
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockAddress, MockCoin, MockCrypto, MockDk, MockScheme, MockSk, MockVk};
    use crate::shuffle::encrypt_layered;

    type S = MockScheme;

    struct Setup {
        players: ParticipantList<S>,
        session: SessionIdentifier,
        coin: MockCoin,
        crypto: MockCrypto,
        encryption_keys: BTreeMap<MockVk, <S as Scheme>::EncryptionKey>,
    }

    impl Setup {
        fn new(n: u32) -> Self {
            let keys: Vec<_> = (1..=n).map(MockVk).collect();
            let encryption_keys = (2..=n)
                .map(|i| (MockVk(i), MockDk(100 + i).encryption_key()))
                .collect();
            Self {
                players: ParticipantList::new(&keys).unwrap(),
                session: SessionIdentifier::new("engine"),
                coin: MockCoin::new(),
                crypto: MockCrypto::new(),
                encryption_keys,
            }
        }

        fn engine<'a>(&'a self, me: &'a MockVk) -> BlameEngine<'a, S, MockCrypto, MockCoin> {
            BlameEngine {
                me,
                players: &self.players,
                session: &self.session,
                round: 0,
                amount: 17,
                coin: &self.coin,
                crypto: &self.crypto,
                encryption_keys: &self.encryption_keys,
                transaction: None,
                hashes: BTreeMap::new(),
            }
        }

        fn signed(&self, from: u32, to: u32, phase: Phase, message: Message<S>) -> SignedPacket<S> {
            Packet {
                message,
                session: self.session.clone(),
                round: 0,
                phase,
                signer: MockVk(from),
                recipient: MockVk(to),
            }
            .sign(&MockSk(from))
        }

        fn blame(&self, from: u32, blame: Blame<S>) -> Packet<S> {
            let mut message = Message::new();
            message.attach_blame(blame);
            Packet {
                message,
                session: self.session.clone(),
                round: 0,
                phase: Phase::Blame,
                signer: MockVk(from),
                recipient: MockVk(1),
            }
        }
    }

    fn onion(address: u64, layers: &[u32]) -> MockAddress {
        let keys: Vec<_> = layers.iter().map(|i| MockDk(100 + i).encryption_key()).collect();
        encrypt_layered::<S>(&MockAddress::Plain(address), keys.iter())
    }

    #[test]
    fn test_funds_blame_is_credible_when_we_agree() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);
        let mut matrix = Matrix::new();
        matrix.put(&me, &MockVk(3), Evidence::new(Reason::NoFundsAtAll, true));

        let mut received = BTreeMap::new();
        received.insert(
            MockVk(2),
            vec![
                setup.blame(2, Blame::NoFundsAtAll { accused: MockVk(3) }),
                setup.blame(
                    2,
                    Blame::NoFundsAtAll {
                        accused: MockVk(1),
                    },
                ),
            ],
        );
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();

        assert!(matrix.credibly_accuses(&MockVk(2), &MockVk(3)));
        assert!(matrix.accuses(&MockVk(2), &MockVk(1)));
        assert!(!matrix.credibly_accuses(&MockVk(2), &MockVk(1)));
    }

    #[test]
    fn test_missing_transaction_is_malformed() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);
        let mut matrix = Matrix::new();
        let mut received = BTreeMap::new();
        received.insert(
            MockVk(3),
            vec![setup.blame(
                3,
                Blame::DoubleSpend {
                    accused: MockVk(2),
                    transaction: None,
                },
            )],
        );
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(3), Reason::MalformedBlame));
    }

    #[test]
    fn test_different_announced_keys_are_caught() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);

        // Player 2 gave player 3 a different key than the one it gave us.
        let mut bogus = Message::new();
        bogus.attach_encryption_key(MockDk(999).encryption_key());
        let evidence = vec![setup.signed(2, 3, Phase::Announcement, bogus)];
        let mut received = BTreeMap::new();
        received.insert(
            MockVk(3),
            vec![setup.blame(3, Blame::EquivocationFailure { evidence })],
        );

        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(2), Reason::EquivocationFailureAnnouncement));
        assert!(!matrix.accuses(&me, &MockVk(3)));
    }

    #[test]
    fn test_replay_finds_the_broken_shuffle() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);

        // Player 1 sends a good onion, player 2 duplicates it instead of adding its own.
        let first: Message<S> = [onion(1, &[2, 3])].into_iter().collect();
        let second: Message<S> = [onion(1, &[3]), onion(1, &[3])].into_iter().collect();

        let mut received = BTreeMap::new();
        received.insert(
            MockVk(2),
            vec![setup.blame(
                2,
                Blame::ShuffleAndEquivocationFailure {
                    key: Some(MockDk(102)),
                    evidence: vec![setup.signed(1, 2, Phase::Shuffling, first)],
                },
            )],
        );
        received.insert(
            MockVk(3),
            vec![
                setup.blame(3, Blame::ShuffleFailure),
                setup.blame(
                    3,
                    Blame::ShuffleAndEquivocationFailure {
                        key: Some(MockDk(103)),
                        evidence: vec![setup.signed(2, 3, Phase::Shuffling, second)],
                    },
                ),
            ],
        );

        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(2), Reason::ShuffleFailure));
        assert!(!matrix.accuses(&me, &MockVk(3)));
    }

    #[test]
    fn test_withheld_shuffle_message_blames_the_receiver() {
        let setup = Setup::new(4);
        let me = MockVk(1);
        let engine = setup.engine(&me);

        // Player 3 sends player 4 plain addresses, and then leaves the message it
        // got from player 2 out of its evidence.
        let first: Message<S> = [onion(1, &[2, 3, 4])].into_iter().collect();
        let garbage: Message<S> = (1..=3).map(MockAddress::Plain).collect();

        let mut received = BTreeMap::new();
        received.insert(
            MockVk(2),
            vec![setup.blame(
                2,
                Blame::ShuffleAndEquivocationFailure {
                    key: Some(MockDk(102)),
                    evidence: vec![setup.signed(1, 2, Phase::Shuffling, first)],
                },
            )],
        );
        received.insert(
            MockVk(3),
            vec![setup.blame(
                3,
                Blame::ShuffleAndEquivocationFailure {
                    key: Some(MockDk(103)),
                    evidence: Vec::new(),
                },
            )],
        );
        received.insert(
            MockVk(4),
            vec![
                setup.blame(4, Blame::ShuffleFailure),
                setup.blame(
                    4,
                    Blame::ShuffleAndEquivocationFailure {
                        key: Some(MockDk(104)),
                        evidence: vec![setup.signed(3, 4, Phase::Shuffling, garbage)],
                    },
                ),
            ],
        );

        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(3), Reason::MalformedBlame));
        assert!(!matrix.accuses(&me, &MockVk(2)));
        assert!(!matrix.accuses(&me, &MockVk(4)));
        assert_eq!(
            matrix.indicted([1, 2, 3, 4].map(MockVk).iter()),
            [MockVk(3)].into_iter().collect()
        );
    }

    #[test]
    fn test_missing_shuffle_message_accuses_nobody() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);

        // Player 3 never got anything, so nothing shows who is at fault.
        let mut received = BTreeMap::new();
        for i in 2..=3 {
            received.insert(
                MockVk(i),
                vec![setup.blame(
                    i,
                    Blame::ShuffleAndEquivocationFailure {
                        key: Some(MockDk(100 + i)),
                        evidence: Vec::new(),
                    },
                )],
            );
        }

        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(!matrix.accuses(&me, &MockVk(2)));
        assert!(!matrix.accuses(&me, &MockVk(3)));
    }

    #[test]
    fn test_equivocation_blame_must_match_the_hash_sent() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let announced = |from: u32| {
            let mut message = Message::new();
            message.attach_encryption_key(MockDk(100 + from).encryption_key());
            setup.signed(from, 3, Phase::Announcement, message)
        };
        let mut received = BTreeMap::new();
        received.insert(
            MockVk(3),
            vec![setup.blame(
                3,
                Blame::EquivocationFailure {
                    evidence: vec![announced(2)],
                },
            )],
        );

        // The keys player 3 forwarded are the ones it hashed.
        let mut keys = Message::new();
        keys.attach_encryption_key(MockDk(102).encryption_key());
        keys.attach_encryption_key(MockDk(103).encryption_key());
        let mut engine = setup.engine(&me);
        engine.hashes.insert(MockVk(3), setup.crypto.hash(&keys));
        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(!matrix.accuses(&me, &MockVk(3)));

        // They aren't.
        let mut engine = setup.engine(&me);
        engine
            .hashes
            .insert(MockVk(3), setup.crypto.hash(&Message::new()));
        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(3), Reason::MalformedBlame));
        assert!(!matrix.accuses(&me, &MockVk(2)));
    }

    #[test]
    fn test_wrong_decryption_key_is_malformed() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);
        let mut received = BTreeMap::new();
        received.insert(
            MockVk(2),
            vec![setup.blame(
                2,
                Blame::ShuffleAndEquivocationFailure {
                    key: Some(MockDk(555)),
                    evidence: Vec::new(),
                },
            )],
        );
        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(2), Reason::MalformedBlame));
    }

    #[test]
    fn test_forged_evidence_is_malformed() {
        let setup = Setup::new(3);
        let me = MockVk(1);
        let engine = setup.engine(&me);
        let mut forged = setup.signed(1, 3, Phase::BroadcastOutput, Message::new());
        forged.packet.signer = MockVk(3);
        let mut received = BTreeMap::new();
        received.insert(
            MockVk(2),
            vec![setup.blame(
                2,
                Blame::ShuffleAndEquivocationFailure {
                    key: Some(MockDk(102)),
                    evidence: vec![forged],
                },
            )],
        );
        let mut matrix = Matrix::new();
        smol::block_on(engine.fill(&mut matrix, &received)).unwrap();
        assert!(matrix.blame_exists(&me, &MockVk(2), Reason::MalformedBlame));
    }

    #[test]
    fn test_peel_strips_all_layers() {
        let message: Message<S> = [onion(4, &[2, 3]), onion(5, &[2, 3])].into_iter().collect();
        let (two, three) = (MockDk(102), MockDk(103));
        assert_eq!(
            peel::<S>(&message, &[&two, &three]),
            Some(vec![MockAddress::Plain(4), MockAddress::Plain(5)])
        );
        assert_eq!(peel::<S>(&message, &[&three, &two]), None);
    }
}
