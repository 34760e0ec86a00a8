use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::InitializationError;

/// Tunables for a shuffle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// How long to wait for any single message before giving up on the round.
    pub timeout: Duration,
    /// How long to wait for the blame messages of the other peers.
    ///
    /// Misbehaving peers may never send one, so this bounds the blame phase.
    pub blame_timeout: Duration,
    /// How many times to restart after eliminating peers.
    pub max_retries: u32,
    /// The smallest number of peers worth shuffling with.
    pub min_players: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            blame_timeout: Duration::from_secs(10),
            max_retries: 3,
            min_players: 2,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), InitializationError> {
        if self.min_players < 2 {
            return Err(InitializationError::BadParameters(format!(
                "a shuffle needs at least 2 players, min_players is {}",
                self.min_players
            )));
        }
        if self.timeout.is_zero() || self.blame_timeout.is_zero() {
            return Err(InitializationError::BadParameters(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
