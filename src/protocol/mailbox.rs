use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::{Phase, ProtocolError};
use crate::blame::Blame;
use crate::config::Config;
use crate::crypto::Scheme;
use crate::message::{Atom, Message};
use crate::network::Network;
use crate::packet::{Packet, SessionIdentifier, SignedPacket};
use crate::participants::ParticipantList;

/// What a receive returns.
///
/// Blame packets interrupt a wait, since the round has to switch to blame
/// handling as soon as another peer does.
#[derive(Debug)]
pub enum Recv<S: Scheme, T> {
    Ok(T),
    Blame(Packet<S>),
}

/// The answers to a request, and the peers who sent blame instead.
type Responses<S> = (
    BTreeMap<<S as Scheme>::VerificationKey, Message<S>>,
    BTreeSet<<S as Scheme>::VerificationKey>,
);

/// Holds the packets which have arrived but haven't been asked for yet.
///
/// Packets are sorted into bins by sender and phase. The first valid packet
/// for a bin is the one that counts; later packets for the same bin are only
/// kept in the archive, to be used as evidence.
#[derive(Debug)]
struct MessageQueue<S: Scheme> {
    pending: BTreeMap<(S::VerificationKey, Phase), Packet<S>>,
    /// Bins which have already been read, and so can't be filled again.
    delivered: BTreeSet<(S::VerificationKey, Phase)>,
    blame: BTreeMap<S::VerificationKey, Vec<Packet<S>>>,
    archive: BTreeMap<Phase, Vec<SignedPacket<S>>>,
}

impl<S: Scheme> MessageQueue<S> {
    fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            delivered: BTreeSet::new(),
            blame: BTreeMap::new(),
            archive: BTreeMap::new(),
        }
    }

    fn push(&mut self, signed: SignedPacket<S>) {
        let packet = signed.packet.clone();
        self.archive.entry(packet.phase).or_default().push(signed);

        if packet.phase == Phase::Blame {
            let packets = self.blame.entry(packet.signer.clone()).or_default();
            if !packets.contains(&packet) {
                packets.push(packet);
            }
            return;
        }

        let key = (packet.signer.clone(), packet.phase);
        if self.delivered.contains(&key) || self.pending.contains_key(&key) {
            trace!(
                peer = ?packet.signer,
                phase = %packet.phase,
                "keeping duplicate packet as evidence only"
            );
            return;
        }
        self.pending.insert(key, packet);
    }

    fn ready(&self, from: &S::VerificationKey, phase: Phase) -> bool {
        self.pending.contains_key(&(from.clone(), phase))
    }

    fn pop(&mut self, from: &S::VerificationKey, phase: Phase) -> Option<Packet<S>> {
        let key = (from.clone(), phase);
        let out = self.pending.remove(&key)?;
        self.delivered.insert(key);
        Some(out)
    }

    fn first_blame(&self) -> Option<Packet<S>> {
        self.blame.values().flatten().next().cloned()
    }
}

/// Whether a blame packet settles what its sender has to say.
///
/// Every peer ends its part in a blame phase with exactly one such packet;
/// marker packets may come before it.
fn is_conclusive<S: Scheme>(packet: &Packet<S>) -> bool {
    packet.message.is_empty()
        || packet.message.atoms().any(|atom| match atom {
            Atom::Blame(blame) => !blame.is_marker(),
            _ => false,
        })
}

/// The inbox and outbox of a single round.
///
/// This signs everything we send, and checks everything we receive: packets
/// for another session, another round, or another recipient, from somebody
/// outside of the round, or with a bad signature are dropped. Packets for
/// a later round are kept aside, to be replayed into the mailbox of that round.
pub struct Mailbox<'a, S: Scheme, N: Network<S>> {
    network: &'a N,
    session: SessionIdentifier,
    round: u32,
    sk: &'a S::SigningKey,
    me: S::VerificationKey,
    players: ParticipantList<S>,
    timeout: Duration,
    blame_timeout: Duration,
    queue: MessageQueue<S>,
    /// Our own blame broadcasts, addressed to ourselves.
    sent_blame: Vec<Packet<S>>,
    backlog: Vec<SignedPacket<S>>,
}

impl<'a, S: Scheme, N: Network<S>> Mailbox<'a, S, N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: &'a N,
        session: SessionIdentifier,
        round: u32,
        sk: &'a S::SigningKey,
        me: S::VerificationKey,
        players: ParticipantList<S>,
        config: &Config,
        backlog: Vec<SignedPacket<S>>,
    ) -> Self {
        let mut out = Self {
            network,
            session,
            round,
            sk,
            me,
            players,
            timeout: config.timeout,
            blame_timeout: config.blame_timeout,
            queue: MessageQueue::new(),
            sent_blame: Vec::new(),
            backlog: Vec::new(),
        };
        for packet in backlog {
            out.accept(packet);
        }
        out
    }

    pub fn session(&self) -> &SessionIdentifier {
        &self.session
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Hand over the packets received for later rounds.
    pub fn take_backlog(&mut self) -> Vec<SignedPacket<S>> {
        std::mem::take(&mut self.backlog)
    }

    fn accept(&mut self, signed: SignedPacket<S>) {
        let packet = &signed.packet;
        if packet.session != self.session {
            trace!(session = %packet.session, "dropping packet for another session");
            return;
        }
        if packet.round > self.round {
            self.backlog.push(signed);
            return;
        }
        if packet.round < self.round {
            trace!(round = packet.round, "dropping packet from an earlier round");
            return;
        }
        if packet.recipient != self.me {
            debug!(peer = ?packet.signer, "dropping packet addressed to somebody else");
            return;
        }
        if packet.signer == self.me || !self.players.contains(&packet.signer) {
            debug!(peer = ?packet.signer, "dropping packet from outside of the round");
            return;
        }
        if !signed.verify() {
            debug!(
                peer = ?packet.signer,
                phase = %packet.phase,
                "dropping packet with bad signature"
            );
            return;
        }
        self.queue.push(signed);
    }

    /// Wait for the next packet from the network, or until the deadline passes.
    async fn pump(&mut self, deadline: Instant, phase: Phase) -> Result<(), ProtocolError> {
        let network = self.network;
        let received = smol::future::or(async { Some(network.receive().await) }, async {
            smol::Timer::at(deadline).await;
            None
        })
        .await;
        match received {
            Some(packet) => {
                self.accept(packet?);
                Ok(())
            }
            None => Err(ProtocolError::Timeout(phase)),
        }
    }

    pub async fn send(&mut self, packet: Packet<S>) -> Result<(), ProtocolError> {
        let recipient = packet.recipient.clone();
        let signed = packet.sign(self.sk);
        self.network.send_to(&recipient, signed).await?;
        Ok(())
    }

    fn packet(
        &self,
        message: Message<S>,
        phase: Phase,
        recipient: S::VerificationKey,
    ) -> Packet<S> {
        Packet {
            message,
            session: self.session.clone(),
            round: self.round,
            phase,
            signer: self.me.clone(),
            recipient,
        }
    }

    /// Send a message to somebody else in the round.
    pub async fn send_to(
        &mut self,
        to: &S::VerificationKey,
        message: Message<S>,
        phase: Phase,
    ) -> Result<(), ProtocolError> {
        let packet = self.packet(message, phase, to.clone());
        self.send(packet).await
    }

    /// Send the same message to everybody else in the round.
    pub async fn broadcast(
        &mut self,
        message: Message<S>,
        phase: Phase,
    ) -> Result<(), ProtocolError> {
        let others: Vec<_> = self.players.others(&self.me).cloned().collect();
        for to in others {
            let packet = self.packet(message.clone(), phase, to);
            self.send(packet).await?;
        }
        if phase == Phase::Blame {
            let me = self.me.clone();
            self.sent_blame.push(self.packet(message, phase, me));
        }
        Ok(())
    }

    /// Wait for the message a peer sends in some phase.
    pub async fn receive_from(
        &mut self,
        from: &S::VerificationKey,
        phase: Phase,
    ) -> Result<Recv<S, Message<S>>, ProtocolError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(packet) = self.queue.pop(from, phase) {
                return Ok(Recv::Ok(packet.message));
            }
            if let Some(blame) = self.queue.first_blame() {
                return Ok(Recv::Blame(blame));
            }
            self.pump(deadline, phase).await?;
        }
    }

    /// Wait for the messages a set of peers send in some phase.
    ///
    /// With `watch_blame`, a blame packet from anybody interrupts the wait.
    pub async fn receive_from_multiple(
        &mut self,
        from: &BTreeSet<S::VerificationKey>,
        phase: Phase,
        watch_blame: bool,
    ) -> Result<Recv<S, BTreeMap<S::VerificationKey, Message<S>>>, ProtocolError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if from.iter().all(|p| self.queue.ready(p, phase)) {
                let out = from
                    .iter()
                    .filter_map(|p| self.queue.pop(p, phase).map(|x| (p.clone(), x.message)))
                    .collect();
                return Ok(Recv::Ok(out));
            }
            if watch_blame {
                if let Some(blame) = self.queue.first_blame() {
                    return Ok(Recv::Blame(blame));
                }
            }
            self.pump(deadline, phase).await?;
        }
    }

    /// Wait until every peer in a set has either answered in some phase,
    /// or sent blame instead.
    ///
    /// This returns the answers, along with the peers who sent blame.
    pub async fn receive_responses(
        &mut self,
        from: &BTreeSet<S::VerificationKey>,
        phase: Phase,
    ) -> Result<Responses<S>, ProtocolError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let settled = from
                .iter()
                .all(|p| self.queue.ready(p, phase) || self.queue.blame.contains_key(p));
            if settled {
                break;
            }
            self.pump(deadline, phase).await?;
        }
        let mut answers = BTreeMap::new();
        let mut blamers = BTreeSet::new();
        for p in from {
            match self.queue.pop(p, phase) {
                Some(packet) => {
                    answers.insert(p.clone(), packet.message);
                }
                None => {
                    blamers.insert(p.clone());
                }
            }
        }
        Ok((answers, blamers))
    }

    /// Whether any peer has sent blame in this round.
    pub fn blame_received(&self) -> bool {
        !self.queue.blame.is_empty()
    }

    /// Whether any peer has reported a problem with the shuffle.
    pub fn shuffle_blamed(&self) -> bool {
        self.queue.blame.values().flatten().any(|packet| {
            packet.message.atoms().any(|atom| match atom {
                Atom::Blame(blame) => {
                    blame.is_marker()
                        || matches!(**blame, Blame::ShuffleAndEquivocationFailure { .. })
                }
                _ => false,
            })
        })
    }

    fn blame_settled(&self) -> bool {
        self.players.others(&self.me).all(|p| {
            self.queue
                .blame
                .get(p)
                .map(|packets| packets.iter().any(is_conclusive))
                .unwrap_or(false)
        })
    }

    /// Collect the blame packets of every peer in the round, ourselves included.
    ///
    /// This waits until every other peer has sent its conclusive blame packet,
    /// or until the blame timeout passes, since a misbehaving peer may never send one.
    pub async fn receive_all_blame(
        &mut self,
    ) -> Result<BTreeMap<S::VerificationKey, Vec<Packet<S>>>, ProtocolError> {
        let deadline = Instant::now() + self.blame_timeout;
        while !self.blame_settled() {
            match self.pump(deadline, Phase::Blame).await {
                Ok(()) => {}
                Err(ProtocolError::Timeout(_)) => {
                    debug!(round = self.round, "blame timeout passed, going on with what we have");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        let mut out = self.queue.blame.clone();
        if !self.sent_blame.is_empty() {
            out.insert(self.me.clone(), self.sent_blame.clone());
        }
        Ok(out)
    }

    /// Every packet received in some phase, duplicates included.
    pub fn packets_by_phase(&self, phase: Phase) -> Vec<SignedPacket<S>> {
        self.queue.archive.get(&phase).cloned().unwrap_or_default()
    }
}
