use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::blame::Matrix;
use crate::coin::Coin;
use crate::config::Config;
use crate::crypto::{Crypto, Scheme, SigningKey};
use crate::network::Network;
use crate::packet::{SessionIdentifier, SignedPacket};
use crate::participants::ParticipantList;
use crate::protocol::mailbox::Mailbox;
use crate::protocol::{InitializationError, Monitor, Phase, ProtocolError, ReturnState};
use crate::round::{Outcome, Round};

/// The arguments needed to take part in a shuffle.
#[derive(Debug)]
pub struct ShuffleArguments<S: Scheme> {
    pub session: SessionIdentifier,
    /// How much every player puts into the shuffle.
    pub amount: u64,
    /// The key controlling the funds we put in.
    pub sk: S::SigningKey,
    /// Every player in the shuffle, including us.
    pub players: Vec<S::VerificationKey>,
    /// Where to send what's left of our funds.
    pub change: Option<S::Address>,
}

/// Runs a shuffle to completion, restarting it without the peers who were
/// caught misbehaving.
///
/// A machine can only be run once.
pub struct ShuffleMachine<S, C, K, N>
where
    S: Scheme,
    C: Crypto<S>,
    K: Coin<S>,
    N: Network<S>,
{
    session: SessionIdentifier,
    amount: u64,
    sk: S::SigningKey,
    me: S::VerificationKey,
    players: ParticipantList<S>,
    change: Option<S::Address>,
    config: Config,
    crypto: C,
    coin: K,
    network: N,
    monitor: Monitor,
    started: bool,
}

impl<S, C, K, N> ShuffleMachine<S, C, K, N>
where
    S: Scheme,
    C: Crypto<S>,
    K: Coin<S>,
    N: Network<S>,
{
    pub fn new(
        args: ShuffleArguments<S>,
        config: Config,
        crypto: C,
        coin: K,
        network: N,
    ) -> Result<Self, InitializationError> {
        config.validate()?;
        if args.amount == 0 {
            return Err(InitializationError::BadParameters(
                "amount must be positive".to_string(),
            ));
        }
        if args.players.len() < 2 {
            return Err(InitializationError::BadParameters(format!(
                "a shuffle needs at least 2 players, got {}",
                args.players.len()
            )));
        }
        let players = ParticipantList::new(&args.players).ok_or_else(|| {
            InitializationError::BadParameters("player list contains duplicates".to_string())
        })?;
        let me = args.sk.verification_key();
        Ok(Self {
            session: args.session,
            amount: args.amount,
            sk: args.sk,
            me,
            players,
            change: args.change,
            config,
            crypto,
            coin,
            network,
            monitor: Monitor::new(),
            started: false,
        })
    }

    /// A handle for watching the progress of the shuffle.
    pub fn monitor(&self) -> Monitor {
        self.monitor.clone()
    }

    pub fn phase(&self) -> Phase {
        self.monitor.phase()
    }

    fn fail(&self, error: ProtocolError) -> ReturnState<S> {
        warn!(session = %self.session, phase = %self.phase(), error = %error, "shuffle failed");
        ReturnState::failure(self.session.clone(), self.phase(), error)
    }

    /// Run the shuffle.
    ///
    /// Failures are reported in the returned state; an error is only returned
    /// when the machine finds itself in a state it should never reach.
    pub async fn run(&mut self) -> Result<ReturnState<S>, ProtocolError> {
        if self.started {
            return Ok(self.fail(ProtocolError::ProtocolStarted));
        }
        self.started = true;
        if !self.players.contains(&self.me) {
            return Ok(self.fail(ProtocolError::InvalidParticipantSet(
                "we're not one of the players".to_string(),
            )));
        }

        let mut eliminated = BTreeSet::new();
        let mut backlog: Vec<SignedPacket<S>> = Vec::new();
        let mut last: Option<Matrix<S>> = None;
        let mut attempt: u32 = 0;
        loop {
            let players = match self.players.without(&eliminated) {
                Some(p) if p.len() >= self.config.min_players => p,
                _ => break,
            };
            info!(
                session = %self.session,
                round = attempt,
                players = players.len(),
                "starting round"
            );

            let mailbox = Mailbox::new(
                &self.network,
                self.session.clone(),
                attempt,
                &self.sk,
                self.me.clone(),
                players.clone(),
                &self.config,
                std::mem::take(&mut backlog),
            );
            let mut round = match Round::new(
                mailbox,
                players.clone(),
                self.amount,
                &self.sk,
                self.change.as_ref(),
                &self.crypto,
                &self.coin,
                &self.monitor,
            ) {
                Ok(x) => x,
                Err(e) => return Ok(self.fail(e)),
            };
            let result = round.execute().await;
            backlog = round.into_backlog();

            let matrix = match result {
                Ok(Outcome::Success {
                    transaction,
                    output_key,
                }) => {
                    return Ok(ReturnState {
                        success: true,
                        session: self.session.clone(),
                        phase: Phase::Completed,
                        error: None,
                        blame: None,
                        transaction: Some(transaction),
                        output_key: Some(output_key),
                    });
                }
                Ok(Outcome::Blame(matrix)) => matrix,
                Err(e @ ProtocolError::InvalidImplementation(_)) => return Err(e),
                Err(e) => return Ok(self.fail(e)),
            };

            let indicted = matrix.indicted(players.iter());
            info!(round = attempt, ?indicted, "round ended in blame");
            if indicted.contains(&self.me) {
                warn!(session = %self.session, "we were eliminated from the shuffle");
                return Ok(ReturnState::blamed(self.session.clone(), matrix));
            }
            attempt += 1;
            let fresh = indicted.iter().any(|p| !eliminated.contains(p));
            last = Some(matrix);
            if !fresh || attempt > self.config.max_retries {
                break;
            }
            eliminated.extend(indicted);
            self.monitor.set(Phase::Uninitiated);
        }

        self.monitor.set(Phase::Blame);
        match last {
            Some(matrix) => Ok(ReturnState::blamed(self.session.clone(), matrix)),
            None => Ok(self.fail(ProtocolError::InvalidParticipantSet(format!(
                "fewer than {} players",
                self.config.min_players
            )))),
        }
    }
}
