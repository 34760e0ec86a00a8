//! Stand-ins for the cryptography, the coin, and the network, for tests.
//!
//! Encryption just wraps an address in a tagged box, signatures are a hash
//! tagged with the signer, and the coin is a shared ledger in memory.
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smol::channel::{Receiver, Sender};

use crate::coin::{Coin, CoinNetworkError};
use crate::crypto::{
    random_inclusive, Crypto, CryptographyError, DecryptionKey, EncryptionKey, Scheme,
    SigningKey, VerificationKey,
};
use crate::network::{Network, NetworkError};
use crate::packet::{Packet, SignedPacket};
use crate::serde::{decode, encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockScheme;

impl Scheme for MockScheme {
    type Address = MockAddress;
    type Signature = MockSignature;
    type Digest = Vec<u8>;
    type Transaction = MockTransaction;
    type VerificationKey = MockVk;
    type SigningKey = MockSk;
    type EncryptionKey = MockEk;
    type DecryptionKey = MockDk;
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MockAddress {
    Plain(u64),
    /// An address encrypted under the key with this number.
    Encrypted(u32, Box<MockAddress>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockSignature {
    key: u32,
    digest: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MockVk(pub u32);

impl VerificationKey<MockScheme> for MockVk {
    fn address(&self) -> MockAddress {
        MockAddress::Plain(u64::from(self.0))
    }

    fn verify(&self, data: &[u8], signature: &MockSignature) -> bool {
        signature.key == self.0 && signature.digest == sha256(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSk(pub u32);

impl SigningKey<MockScheme> for MockSk {
    fn verification_key(&self) -> MockVk {
        MockVk(self.0)
    }

    fn sign(&self, data: &[u8]) -> MockSignature {
        MockSignature {
            key: self.0,
            digest: sha256(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockEk(pub u32);

impl EncryptionKey<MockScheme> for MockEk {
    fn encrypt(&self, address: &MockAddress) -> MockAddress {
        MockAddress::Encrypted(self.0, Box::new(address.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockDk(pub u32);

impl DecryptionKey<MockScheme> for MockDk {
    fn encryption_key(&self) -> MockEk {
        MockEk(self.0)
    }

    fn decrypt(&self, address: &MockAddress) -> Result<MockAddress, CryptographyError> {
        match address {
            MockAddress::Encrypted(key, inner) if *key == self.0 => Ok((**inner).clone()),
            MockAddress::Encrypted(..) => Err(CryptographyError::WrongKey),
            MockAddress::Plain(_) => Err(CryptographyError::NotEncrypted),
        }
    }
}

/// Hands out fresh keys, numbered from a counter shared by every clone.
///
/// Key numbers start high enough not to collide with the players' own keys.
#[derive(Debug, Clone)]
pub struct MockCrypto {
    next: Arc<AtomicU32>,
}

impl MockCrypto {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU32::new(1000)),
        }
    }

    fn fresh(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Crypto<MockScheme> for MockCrypto {
    fn make_signing_key(&self) -> MockSk {
        MockSk(self.fresh())
    }

    fn make_decryption_key(&self) -> MockDk {
        MockDk(self.fresh())
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        sha256(data)
    }

    fn get_random(&self, n: usize) -> usize {
        random_inclusive(&mut OsRng, n)
    }
}

/// Plays back a fixed tape of random draws.
#[derive(Debug)]
pub struct SequenceCrypto {
    inner: MockCrypto,
    draws: Mutex<VecDeque<usize>>,
}

impl SequenceCrypto {
    pub fn new(draws: &[usize]) -> Self {
        Self {
            inner: MockCrypto::new(),
            draws: Mutex::new(draws.iter().copied().collect()),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.draws.lock().unwrap().is_empty()
    }
}

impl Crypto<MockScheme> for SequenceCrypto {
    fn make_signing_key(&self) -> MockSk {
        self.inner.make_signing_key()
    }

    fn make_decryption_key(&self) -> MockDk {
        self.inner.make_decryption_key()
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        self.inner.digest(data)
    }

    fn get_random(&self, _n: usize) -> usize {
        self.draws
            .lock()
            .unwrap()
            .pop_front()
            .expect("random tape ran out")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockTransaction {
    pub inputs: Vec<(MockAddress, u64)>,
    pub outputs: Vec<(MockAddress, u64)>,
    /// Lets a peer build a transaction nobody else agrees with.
    pub z: u32,
}

#[derive(Debug, Default)]
struct Ledger {
    balances: BTreeMap<MockAddress, u64>,
    /// Transactions the network has seen, but which haven't confirmed.
    pending: Vec<MockTransaction>,
    sent: Vec<MockTransaction>,
}

impl Ledger {
    fn spent(&self, address: &MockAddress) -> u64 {
        self.pending
            .iter()
            .flat_map(|t| t.inputs.iter())
            .filter(|(a, _)| a == address)
            .map(|(_, v)| v)
            .sum()
    }

    fn available(&self, address: &MockAddress) -> u64 {
        self.balances
            .get(address)
            .copied()
            .unwrap_or(0)
            .saturating_sub(self.spent(address))
    }
}

/// A view on a ledger shared between peers.
#[derive(Debug, Clone)]
pub struct MockCoin {
    ledger: Arc<Mutex<Ledger>>,
    z: u32,
}

impl MockCoin {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            z: 1,
        }
    }

    /// The same ledger, but building transactions with a different `z`.
    pub fn mutated(&self, z: u32) -> Self {
        Self {
            ledger: self.ledger.clone(),
            z,
        }
    }

    pub fn fund(&self, address: MockAddress, value: u64) {
        self.ledger.lock().unwrap().balances.insert(address, value);
    }

    /// Spend from an address, leaving the transaction unconfirmed.
    pub fn spend(&self, from: MockAddress, value: u64) -> MockTransaction {
        let transaction = MockTransaction {
            inputs: vec![(from, value)],
            outputs: vec![(MockAddress::Plain(u64::MAX), value)],
            z: 0,
        };
        self.ledger.lock().unwrap().pending.push(transaction.clone());
        transaction
    }

    pub fn sent(&self) -> Vec<MockTransaction> {
        self.ledger.lock().unwrap().sent.clone()
    }
}

impl Coin<MockScheme> for MockCoin {
    async fn value_held(&self, address: &MockAddress) -> Result<u64, CoinNetworkError> {
        Ok(self.ledger.lock().unwrap().available(address))
    }

    async fn get_conflicting_transaction(
        &self,
        address: &MockAddress,
        amount: u64,
    ) -> Result<Option<MockTransaction>, CoinNetworkError> {
        let ledger = self.ledger.lock().unwrap();
        if ledger.available(address) >= amount {
            return Ok(None);
        }
        let found = ledger
            .pending
            .iter()
            .find(|t| t.inputs.iter().any(|(a, _)| a == address))
            .cloned();
        Ok(found)
    }

    async fn spends_from(
        &self,
        address: &MockAddress,
        amount: u64,
        transaction: &MockTransaction,
    ) -> Result<bool, CoinNetworkError> {
        let ledger = self.ledger.lock().unwrap();
        if !ledger.pending.contains(transaction) {
            return Ok(false);
        }
        let balance = ledger.balances.get(address).copied().unwrap_or(0);
        let spent: u64 = transaction
            .inputs
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, v)| v)
            .sum();
        Ok(spent > 0 && balance.saturating_sub(spent) < amount)
    }

    async fn shuffle_transaction(
        &self,
        amount: u64,
        inputs: &[MockVk],
        outputs: &[MockAddress],
        change: &BTreeMap<MockVk, MockAddress>,
    ) -> Result<MockTransaction, CoinNetworkError> {
        let ledger = self.ledger.lock().unwrap();
        let mut transaction = MockTransaction {
            inputs: Vec::new(),
            outputs: outputs.iter().map(|a| (a.clone(), amount)).collect(),
            z: self.z,
        };
        for vk in inputs {
            let address = vk.address();
            let available = ledger.available(&address);
            if available < amount {
                return Err(CoinNetworkError::Rejected(format!(
                    "{:?} holds {} out of {}",
                    address, available, amount
                )));
            }
            transaction.inputs.push((address, amount));
            if let Some(to) = change.get(vk) {
                transaction.outputs.push((to.clone(), available - amount));
            }
        }
        Ok(transaction)
    }

    async fn send(&self, transaction: &MockTransaction) -> Result<(), CoinNetworkError> {
        self.ledger.lock().unwrap().sent.push(transaction.clone());
        Ok(())
    }
}

/// Connects a fixed set of peers with in-memory channels.
///
/// The hub holds on to every channel, so sending never fails, even to a peer
/// that isn't running.
#[derive(Debug)]
pub struct MockHub {
    senders: BTreeMap<MockVk, Sender<Vec<u8>>>,
    receivers: BTreeMap<MockVk, Receiver<Vec<u8>>>,
}

impl MockHub {
    pub fn new(n: u32) -> Self {
        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for i in 1..=n {
            let (s, r) = smol::channel::unbounded();
            senders.insert(MockVk(i), s);
            receivers.insert(MockVk(i), r);
        }
        Self { senders, receivers }
    }

    pub fn network(&self, me: MockVk) -> MockNetwork {
        MockNetwork {
            senders: self.senders.clone(),
            inbox: self.receivers[&me].clone(),
            tamper: None,
        }
    }
}

type Tamper = Arc<dyn Fn(&mut Packet<MockScheme>) + Send + Sync>;

/// One peer's end of a [MockHub].
#[derive(Clone)]
pub struct MockNetwork {
    senders: BTreeMap<MockVk, Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
    tamper: Option<(MockSk, Tamper)>,
}

impl MockNetwork {
    /// Rewrite outgoing packets before they're sent, signing them again.
    pub fn tampered(
        mut self,
        sk: MockSk,
        f: impl Fn(&mut Packet<MockScheme>) + Send + Sync + 'static,
    ) -> Self {
        self.tamper = Some((sk, Arc::new(f)));
        self
    }
}

impl fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockNetwork")
            .field("peers", &self.senders.len())
            .field("tampered", &self.tamper.is_some())
            .finish()
    }
}

impl Network<MockScheme> for MockNetwork {
    async fn send_to(
        &self,
        to: &MockVk,
        packet: SignedPacket<MockScheme>,
    ) -> Result<(), NetworkError> {
        let packet = match &self.tamper {
            Some((sk, f)) => {
                let mut inner = packet.packet;
                f(&mut inner);
                inner.sign(sk)
            }
            None => packet,
        };
        let sender = self.senders.get(to).ok_or(NetworkError::UnknownPeer)?;
        sender
            .send(encode(&packet))
            .await
            .map_err(|_| NetworkError::Closed)
    }

    async fn receive(&self) -> Result<SignedPacket<MockScheme>, NetworkError> {
        let bytes = self.inbox.recv().await.map_err(|_| NetworkError::Closed)?;
        decode(&bytes).map_err(|e| NetworkError::Other(e.to_string()))
    }
}
