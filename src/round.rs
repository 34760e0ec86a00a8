//! A single attempt at a shuffle, with a fixed set of players.
//!
//! The round goes through the phases in order:
//!
//! 1. Every player checks that everybody can pay for the shuffle, and then
//!    announces a fresh encryption key, along with an optional change address.
//!    Player 1 is the first to encrypt, and so never needs a key.
//! 2. Each player peels its layer off the onions handed over by the previous
//!    player, adds its own new address, wrapped for the players after it,
//!    shuffles the list, and hands it to the next player.
//! 3. The last player broadcasts the final list of addresses.
//! 4. Everybody compares a hash of the encryption keys they received, to make
//!    sure nobody announced different keys to different peers.
//! 5. Everybody builds the shuffle transaction, signs it, and checks the
//!    signatures of the other players, before publishing it.
//!
//! Any deviation ends the round in the blame phase, where the peers exchange
//! evidence, and work out who should be left out of the next round.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::blame::{engine::BlameEngine, Artifact, Blame, Evidence, Matrix, Reason};
use crate::coin::{Coin, CoinNetworkError};
use crate::crypto::{
    Crypto, CryptographyError, DecryptionKey, Scheme, SigningKey, VerificationKey,
};
use crate::message::{are_equal, FormatError, Message};
use crate::network::{Network, NetworkError};
use crate::packet::SignedPacket;
use crate::participants::ParticipantList;
use crate::protocol::mailbox::{Mailbox, Recv};
use crate::protocol::{Monitor, Phase, ProtocolError};
use crate::serde::{sign_value, verify_value};
use crate::shuffle::{decrypt_all, encrypt_layered, shuffle, PeelError};

/// Keep the signatures which don't sign the transaction under their player's key.
fn invalid_signatures<S: Scheme>(
    transaction: &S::Transaction,
    signatures: BTreeMap<S::VerificationKey, S::Signature>,
) -> BTreeMap<S::VerificationKey, S::Signature> {
    signatures
        .into_iter()
        .filter(|(player, signature)| !verify_value::<S, _>(player, transaction, signature))
        .collect()
}

/// Why a round stopped before completing.
#[derive(Debug)]
pub(crate) enum Halt<S: Scheme> {
    /// The round went through the blame phase.
    Blame(Matrix<S>),
    Error(ProtocolError),
}

impl<S: Scheme> From<ProtocolError> for Halt<S> {
    fn from(e: ProtocolError) -> Self {
        Halt::Error(e)
    }
}

impl<S: Scheme> From<FormatError> for Halt<S> {
    fn from(e: FormatError) -> Self {
        Halt::Error(e.into())
    }
}

impl<S: Scheme> From<CryptographyError> for Halt<S> {
    fn from(e: CryptographyError) -> Self {
        Halt::Error(e.into())
    }
}

impl<S: Scheme> From<CoinNetworkError> for Halt<S> {
    fn from(e: CoinNetworkError) -> Self {
        Halt::Error(e.into())
    }
}

impl<S: Scheme> From<NetworkError> for Halt<S> {
    fn from(e: NetworkError) -> Self {
        Halt::Error(e.into())
    }
}

/// How a round ended, when it didn't hit an error.
#[derive(Debug)]
pub(crate) enum Outcome<S: Scheme> {
    Success {
        transaction: S::Transaction,
        output_key: S::SigningKey,
    },
    Blame(Matrix<S>),
}

fn unwatched<S: Scheme, T>(received: Recv<S, T>) -> Result<T, ProtocolError> {
    match received {
        Recv::Ok(x) => Ok(x),
        Recv::Blame(_) => Err(ProtocolError::InvalidImplementation(
            "blame interrupted a receive which wasn't watching for it".to_string(),
        )),
    }
}

pub(crate) struct Round<'a, S, C, K, N>
where
    S: Scheme,
    C: Crypto<S>,
    K: Coin<S>,
    N: Network<S>,
{
    amount: u64,
    sk: &'a S::SigningKey,
    me: S::VerificationKey,
    index: usize,
    players: ParticipantList<S>,
    change: Option<&'a S::Address>,
    crypto: &'a C,
    coin: &'a K,
    monitor: &'a Monitor,
    mailbox: Mailbox<'a, S, N>,

    dk: Option<S::DecryptionKey>,
    encryption_keys: BTreeMap<S::VerificationKey, S::EncryptionKey>,
    change_addresses: BTreeMap<S::VerificationKey, S::Address>,
    output_key: Option<S::SigningKey>,
    output: Option<S::Address>,
    /// The onions we hold, and finally the new addresses.
    outputs: Vec<S::Address>,
    hash_sent: bool,
    equivocation_checked: bool,
    transaction: Option<S::Transaction>,
    matrix: Matrix<S>,
}

impl<'a, S, C, K, N> Round<'a, S, C, K, N>
where
    S: Scheme,
    C: Crypto<S>,
    K: Coin<S>,
    N: Network<S>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox: Mailbox<'a, S, N>,
        players: ParticipantList<S>,
        amount: u64,
        sk: &'a S::SigningKey,
        change: Option<&'a S::Address>,
        crypto: &'a C,
        coin: &'a K,
        monitor: &'a Monitor,
    ) -> Result<Self, ProtocolError> {
        let me = sk.verification_key();
        let index = players.index(&me).ok_or_else(|| {
            ProtocolError::InvalidParticipantSet("we're not part of this round".to_string())
        })?;
        Ok(Self {
            amount,
            sk,
            me,
            index,
            players,
            change,
            crypto,
            coin,
            monitor,
            mailbox,
            dk: None,
            encryption_keys: BTreeMap::new(),
            change_addresses: BTreeMap::new(),
            output_key: None,
            output: None,
            outputs: Vec::new(),
            hash_sent: false,
            equivocation_checked: false,
            transaction: None,
            matrix: Matrix::new(),
        })
    }

    /// Run the round to the end.
    ///
    /// Blame is a normal way for a round to end, so only errors that stop the
    /// round short of any conclusion are returned as errors.
    pub async fn execute(&mut self) -> Result<Outcome<S>, ProtocolError> {
        match self.run().await {
            Ok(transaction) => {
                let output_key = self.output_key.take().ok_or_else(|| {
                    ProtocolError::InvalidImplementation(
                        "completed without an output key".to_string(),
                    )
                })?;
                Ok(Outcome::Success {
                    transaction,
                    output_key,
                })
            }
            Err(Halt::Blame(matrix)) => Ok(Outcome::Blame(matrix)),
            Err(Halt::Error(e)) => Err(e),
        }
    }

    /// The packets which arrived for later rounds.
    pub fn into_backlog(mut self) -> Vec<SignedPacket<S>> {
        self.mailbox.take_backlog()
    }

    async fn run(&mut self) -> Result<S::Transaction, Halt<S>> {
        if self.mailbox.round() > 0 {
            self.check_players().await?;
        }
        self.announcement().await?;
        self.shuffling().await?;
        self.broadcast_output().await?;
        self.equivocation_check().await?;
        // Somebody had trouble with the shuffle, even if the hashes agree.
        if self.mailbox.blame_received() {
            return Err(self.blame_shuffle_misbehavior().await);
        }
        self.verification_and_submission().await
    }

    fn set_phase(&self, phase: Phase) {
        debug!(round = self.mailbox.round(), %phase, "entering phase");
        self.monitor.set(phase);
    }

    fn others(&self) -> BTreeSet<S::VerificationKey> {
        self.players.others(&self.me).cloned().collect()
    }

    fn player(&self, i: usize) -> Result<&S::VerificationKey, ProtocolError> {
        self.players.get(i).ok_or_else(|| {
            ProtocolError::InvalidImplementation(format!("no player numbered {}", i))
        })
    }

    /// The encryption keys of the players numbered `first` to `last`, in order.
    fn keys_of(&self, first: usize, last: usize) -> Result<Vec<S::EncryptionKey>, ProtocolError> {
        self.players
            .player_set(first, last)
            .iter()
            .map(|p| {
                self.encryption_keys.get(p).cloned().ok_or_else(|| {
                    ProtocolError::InvalidImplementation(format!("no encryption key for {:?}", p))
                })
            })
            .collect()
    }

    /// After eliminating players, make sure everybody left agrees on who that is.
    async fn check_players(&mut self) -> Result<(), Halt<S>> {
        let hash = self.crypto.hash(&self.players.addresses());
        self.mailbox.broadcast(hash.clone(), Phase::Uninitiated).await?;
        let others = self.others();
        let received = self
            .mailbox
            .receive_from_multiple(&others, Phase::Uninitiated, false)
            .await?;
        let hashes = unwatched(received)?;
        if !are_equal(hashes.values().chain(std::iter::once(&hash))) {
            return Err(ProtocolError::InvalidParticipantSet(
                "peers disagree on who is left in the round".to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn check_funds(&mut self) -> Result<(), Halt<S>> {
        let mut message = Message::new();
        for player in self.players.iter() {
            let address = player.address();
            let held = self.coin.value_held(&address).await?;
            if held >= self.amount {
                continue;
            }
            warn!(peer = ?player, held, amount = self.amount, "player can't pay for the shuffle");
            match self
                .coin
                .get_conflicting_transaction(&address, self.amount)
                .await?
            {
                Some(transaction) => {
                    self.matrix.put(
                        &self.me,
                        player,
                        Evidence::with_artifact(
                            Reason::InsufficientFunds,
                            true,
                            Artifact::Transaction(transaction.clone()),
                        ),
                    );
                    message.attach_blame(Blame::InsufficientFunds {
                        accused: player.clone(),
                        transaction: Some(transaction),
                    });
                }
                None => {
                    self.matrix
                        .put(&self.me, player, Evidence::new(Reason::NoFundsAtAll, true));
                    message.attach_blame(Blame::NoFundsAtAll {
                        accused: player.clone(),
                    });
                }
            }
        }
        if message.is_empty() {
            return Ok(());
        }
        Err(self.enter_blame(message).await)
    }

    async fn announcement(&mut self) -> Result<(), Halt<S>> {
        self.set_phase(Phase::Announcement);
        self.check_funds().await?;

        let mut message = Message::new();
        if self.index > 1 {
            let dk = self.crypto.make_decryption_key();
            let ek = dk.encryption_key();
            message.attach_encryption_key(ek.clone());
            self.encryption_keys.insert(self.me.clone(), ek);
            self.dk = Some(dk);
        }
        if let Some(change) = self.change {
            message.attach_address(change.clone());
            self.change_addresses.insert(self.me.clone(), change.clone());
        }
        self.mailbox.broadcast(message, Phase::Announcement).await?;

        let others = self.others();
        let received = self
            .mailbox
            .receive_from_multiple(&others, Phase::Announcement, true)
            .await?;
        let announcements = match received {
            Recv::Ok(x) => x,
            Recv::Blame(packet) => {
                debug!(peer = ?packet.signer, "blame received during announcement");
                return Err(self.enter_blame(Message::new()).await);
            }
        };
        for (player, mut message) in announcements {
            if self.players.index(&player).unwrap_or(0) > 1 {
                let ek = message.read_encryption_key()?;
                self.encryption_keys.insert(player.clone(), ek);
            }
            if !message.is_empty() {
                let change = message.read_address()?;
                self.change_addresses.insert(player, change);
            }
        }
        Ok(())
    }

    async fn shuffling(&mut self) -> Result<(), Halt<S>> {
        self.set_phase(Phase::Shuffling);
        let n = self.players.len();

        let output_key = self.crypto.make_signing_key();
        let output = output_key.verification_key().address();
        self.output_key = Some(output_key);
        self.output = Some(output.clone());

        let later = self.keys_of(self.index + 1, n)?;
        let onion = encrypt_layered::<S>(&output, later.iter());

        let mut onions = Vec::new();
        if self.index > 1 {
            let from = self.player(self.index - 1)?.clone();
            let mut message = match self.mailbox.receive_from(&from, Phase::Shuffling).await? {
                Recv::Ok(x) => x,
                Recv::Blame(_) => return Err(self.blame_shuffle_misbehavior().await),
            };
            let received = match message.read_addresses() {
                Ok(x) => x,
                Err(e) => {
                    warn!(peer = ?from, error = %e, "shuffle message isn't a list of addresses");
                    return Err(self.report(Blame::ShuffleFailure).await);
                }
            };
            let dk = self.dk.as_ref().ok_or_else(|| {
                ProtocolError::InvalidImplementation("no decryption key".to_string())
            })?;
            let peeled = decrypt_all::<S>(dk, &received, self.index - 1);
            match peeled {
                Ok(x) => onions = x,
                Err(PeelError::Count { expected, found }) => {
                    warn!(peer = ?from, expected, found, "wrong number of onions");
                    let accused = self.players.last().clone();
                    return Err(self.report(Blame::MissingOutput { accused }).await);
                }
                Err(PeelError::Shuffle(e)) => {
                    warn!(peer = ?from, error = ?e, "failed to peel the onions we were handed");
                    return Err(self.report(Blame::ShuffleFailure).await);
                }
            }
        }
        onions.push(onion);
        let onions = shuffle::<S, _>(self.crypto, onions);

        if self.index < n {
            let to = self.player(self.index + 1)?.clone();
            self.mailbox
                .send_to(&to, onions.into_iter().collect(), Phase::Shuffling)
                .await?;
        } else {
            self.outputs = onions;
        }
        Ok(())
    }

    async fn broadcast_output(&mut self) -> Result<(), Halt<S>> {
        self.set_phase(Phase::BroadcastOutput);
        let n = self.players.len();
        if self.index == n {
            let message = self.outputs.iter().cloned().collect();
            self.mailbox.broadcast(message, Phase::BroadcastOutput).await?;
            return Ok(());
        }

        let last = self.players.last().clone();
        let mut message = match self.mailbox.receive_from(&last, Phase::BroadcastOutput).await? {
            Recv::Ok(x) => x,
            Recv::Blame(_) => return Err(self.blame_shuffle_misbehavior().await),
        };
        let outputs = message.read_addresses().unwrap_or_default();
        let distinct: BTreeSet<_> = outputs.iter().collect();
        let present = self.output.as_ref().map_or(false, |x| distinct.contains(x));
        if outputs.len() != n || distinct.len() != n || !present {
            warn!(peer = ?last, count = outputs.len(), present, "bad output list");
            return Err(self.report(Blame::MissingOutput { accused: last }).await);
        }
        self.outputs = outputs;
        Ok(())
    }

    /// Check that everybody received the same encryption keys.
    ///
    /// This can be reached twice in a round, when a problem with the shuffle is
    /// only noticed after the check passed; the hash is only exchanged once.
    async fn equivocation_check(&mut self) -> Result<(), Halt<S>> {
        self.set_phase(Phase::EquivocationCheck);
        if self.equivocation_checked {
            return Ok(());
        }

        let mut keys = Message::new();
        for key in self.keys_of(2, self.players.len())? {
            keys.attach_encryption_key(key);
        }
        let hash = self.crypto.hash(&keys);
        if !self.hash_sent {
            self.mailbox
                .broadcast(hash.clone(), Phase::EquivocationCheck)
                .await?;
            self.hash_sent = true;
        }

        let others = self.others();
        let received = self
            .mailbox
            .receive_from_multiple(&others, Phase::EquivocationCheck, false)
            .await?;
        let hashes = unwatched(received)?;
        if are_equal(hashes.values().chain(std::iter::once(&hash))) {
            self.equivocation_checked = true;
            return Ok(());
        }

        warn!(round = self.mailbox.round(), "peers received different encryption keys");
        let mut evidence = self.mailbox.packets_by_phase(Phase::Announcement);
        evidence.extend(self.mailbox.packets_by_phase(Phase::BroadcastOutput));
        let mut message = Message::new();
        message.attach_blame(Blame::EquivocationFailure { evidence });
        Err(self.enter_blame(message).await)
    }

    /// Announce a problem with the shuffle, then follow up with the evidence.
    async fn report(&mut self, marker: Blame<S>) -> Halt<S> {
        self.set_phase(Phase::Blame);
        let mut message = Message::new();
        message.attach_blame(marker);
        if let Err(e) = self.mailbox.broadcast(message, Phase::Blame).await {
            return e.into();
        }
        self.blame_shuffle_misbehavior().await
    }

    /// Disclose our decryption key, and everything we saw of the shuffle.
    ///
    /// With every key in hand, the peers can replay the shuffle and find out
    /// who broke it. Equivocation has to be ruled out first, since otherwise
    /// the keys would be the wrong evidence.
    async fn blame_shuffle_misbehavior(&mut self) -> Halt<S> {
        if let Err(halt) = self.equivocation_check().await {
            return halt;
        }
        let mut evidence = self.mailbox.packets_by_phase(Phase::Shuffling);
        evidence.extend(self.mailbox.packets_by_phase(Phase::BroadcastOutput));
        let mut message = Message::new();
        message.attach_blame(Blame::ShuffleAndEquivocationFailure {
            key: self.dk.clone(),
            evidence,
        });
        self.enter_blame(message).await
    }

    async fn verification_and_submission(&mut self) -> Result<S::Transaction, Halt<S>> {
        self.set_phase(Phase::VerificationAndSubmission);
        let inputs: Vec<_> = self.players.iter().cloned().collect();
        let built = self
            .coin
            .shuffle_transaction(self.amount, &inputs, &self.outputs, &self.change_addresses)
            .await;
        let transaction = match built {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "couldn't build the shuffle transaction");
                return Err(self.blame_double_spend(e).await);
            }
        };
        self.transaction = Some(transaction.clone());

        let signature = sign_value::<S, _>(self.sk, &transaction);
        let mut message = Message::new();
        message.attach_signature(signature.clone());
        self.mailbox
            .broadcast(message, Phase::VerificationAndSubmission)
            .await?;

        let others = self.others();
        let (responses, blamers) = self
            .mailbox
            .receive_responses(&others, Phase::VerificationAndSubmission)
            .await?;

        let mut signatures = BTreeMap::new();
        signatures.insert(self.me.clone(), signature);
        for (player, mut message) in responses {
            signatures.insert(player, message.read_signature()?);
        }
        let mut invalid = invalid_signatures::<S>(&transaction, signatures);
        if invalid.remove(&self.me).is_some() {
            return Err(ProtocolError::InvalidImplementation(
                "our own signature on the shuffle transaction doesn't verify".to_string(),
            )
            .into());
        }
        for (player, signature) in &invalid {
            warn!(peer = ?player, "invalid signature on the shuffle transaction");
            self.matrix.put(
                &self.me,
                player,
                Evidence::with_artifact(
                    Reason::InvalidSignature,
                    true,
                    Artifact::Signature(signature.clone()),
                ),
            );
        }
        if !invalid.is_empty() {
            let mut message = Message::new();
            message.attach_blame(Blame::InvalidSignature {
                signatures: Some(invalid),
            });
            return Err(self.enter_blame(message).await);
        }
        if !blamers.is_empty() || self.mailbox.blame_received() {
            debug!(?blamers, "blame received instead of signatures");
            if self.mailbox.shuffle_blamed() {
                return Err(self.blame_shuffle_misbehavior().await);
            }
            return Err(self.enter_blame(Message::new()).await);
        }

        self.coin.send(&transaction).await?;
        self.set_phase(Phase::Completed);
        info!(
            round = self.mailbox.round(),
            players = self.players.len(),
            "shuffle transaction sent"
        );
        Ok(transaction)
    }

    /// Look for the transactions which made the shuffle transaction impossible.
    async fn blame_double_spend(&mut self, error: CoinNetworkError) -> Halt<S> {
        let mut message = Message::new();
        for player in self.players.iter() {
            let found = self
                .coin
                .get_conflicting_transaction(&player.address(), self.amount)
                .await;
            let transaction = match found {
                Ok(Some(x)) => x,
                Ok(None) => continue,
                Err(e) => return e.into(),
            };
            warn!(peer = ?player, "player spent their funds during the shuffle");
            self.matrix.put(
                &self.me,
                player,
                Evidence::with_artifact(
                    Reason::DoubleSpend,
                    true,
                    Artifact::Transaction(transaction.clone()),
                ),
            );
            message.attach_blame(Blame::DoubleSpend {
                accused: player.clone(),
                transaction: Some(transaction),
            });
        }
        if message.is_empty() {
            return error.into();
        }
        self.enter_blame(message).await
    }

    async fn enter_blame(&mut self, message: Message<S>) -> Halt<S> {
        match self.blame(message).await {
            Ok(matrix) => Halt::Blame(matrix),
            Err(e) => Halt::Error(e),
        }
    }

    async fn blame(&mut self, message: Message<S>) -> Result<Matrix<S>, ProtocolError> {
        self.set_phase(Phase::Blame);
        self.mailbox.broadcast(message, Phase::Blame).await?;
        let received = self.mailbox.receive_all_blame().await?;

        let mut hashes = BTreeMap::new();
        for signed in self.mailbox.packets_by_phase(Phase::EquivocationCheck) {
            hashes
                .entry(signed.packet.signer)
                .or_insert(signed.packet.message);
        }
        let mut matrix = std::mem::take(&mut self.matrix);
        let engine = BlameEngine {
            me: &self.me,
            players: &self.players,
            session: self.mailbox.session(),
            round: self.mailbox.round(),
            amount: self.amount,
            coin: self.coin,
            crypto: self.crypto,
            encryption_keys: &self.encryption_keys,
            transaction: self.transaction.as_ref(),
            hashes,
        };
        engine.fill(&mut matrix, &received).await?;
        info!(round = self.mailbox.round(), "blame phase over");
        Ok(matrix)
    }
}
