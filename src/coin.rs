use std::collections::BTreeMap;

use thiserror::Error;

use crate::crypto::Scheme;

/// An error raised while talking to the cryptocurrency.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoinNetworkError {
    #[error("coin network unreachable: {0}")]
    Unreachable(String),
    /// The coin refused to build or accept a transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// The view of the cryptocurrency a peer needs.
///
/// Amounts are in the smallest unit of the currency.
#[allow(async_fn_in_trait)]
pub trait Coin<S: Scheme> {
    /// The balance available at an address.
    async fn value_held(&self, address: &S::Address) -> Result<u64, CoinNetworkError>;

    /// Find a transaction preventing `address` from spending `amount`, if any.
    ///
    /// This is either a transaction spending the same funds, or one leaving too
    /// little behind to pay for the shuffle.
    async fn get_conflicting_transaction(
        &self,
        address: &S::Address,
        amount: u64,
    ) -> Result<Option<S::Transaction>, CoinNetworkError>;

    /// Check that `transaction` spends from `address` in a way that leaves less
    /// than `amount` available.
    async fn spends_from(
        &self,
        address: &S::Address,
        amount: u64,
        transaction: &S::Transaction,
    ) -> Result<bool, CoinNetworkError>;

    /// Build the joint transaction.
    ///
    /// Every input key spends `amount` from its address, each output receives
    /// `amount`, and whatever is left over goes to the change address of that
    /// input, when it has one.
    async fn shuffle_transaction(
        &self,
        amount: u64,
        inputs: &[S::VerificationKey],
        outputs: &[S::Address],
        change: &BTreeMap<S::VerificationKey, S::Address>,
    ) -> Result<S::Transaction, CoinNetworkError>;

    /// Publish a transaction to the cryptocurrency network.
    async fn send(&self, transaction: &S::Transaction) -> Result<(), CoinNetworkError>;
}
