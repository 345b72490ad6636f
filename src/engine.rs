//! # Summary
//!
//! The consensus engine orchestrates the proposer, acceptor, and learner
//! roles for every instance, persists protocol state ahead of every reply,
//! and applies decided commands to the replicated state machine exactly
//! once, in strictly increasing instance order.
//!
//! Messages a node addresses to itself bypass the transport entirely and
//! are handled synchronously, so a single-node participant set decides in
//! one call. Everything here assumes the transport's guarantee of ordered,
//! deduplicated per-link delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::config::Config;
use crate::env::{Env, NodeId, Task};
use crate::packet::{protocol, Kind, Paxos, Promise, Value};
use crate::round::{ProposalNumber, Round};
use crate::storage::Log;
use crate::transport::Transport;

/// The replicated application. `apply` is invoked at most once per
/// instance, in strictly increasing instance order, and never for the
/// gap-fill marker.
pub trait State {
    /// Applies one decided command. Returning an error leaves the instance
    /// unexecuted; it will be retried before any later instance runs.
    fn apply(
        &mut self,
        instance: u32,
        command: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Learner log record: the decided value for an instance, and whether the
/// application has executed it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DecidedRecord {
    pub instance: u32,
    pub value: Value,
    pub executed: bool,
}

/// Acceptor log record: the durable promise/accept state for an instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AcceptorRecord {
    pub instance: u32,
    pub promised: Option<ProposalNumber>,
    pub accepted: Option<(ProposalNumber, Value)>,
}

pub struct Engine<S> {
    id: NodeId,
    peers: Vec<NodeId>,
    proposal_delay: Duration,
    rounds: BTreeMap<u32, Round>,
    /// Highest instance the application has executed; 0 means none.
    /// Executed instances always form a contiguous prefix.
    highest_executed: u32,
    decided_log: Log<DecidedRecord>,
    acceptor_log: Log<AcceptorRecord>,
    state: S,
}

impl<S: State> Engine<S> {
    /// Opens the durable logs and reconstructs every round they mention. A
    /// restarted node converges through the same catch-up path as one that
    /// merely saw delayed messages; run [`Engine::catch_up`] once after
    /// this.
    pub fn new(config: &Config, state: S) -> Self {
        let mut decided_log = Log::<DecidedRecord>::open(config.dir.join("decided.log"));
        let mut acceptor_log = Log::<AcceptorRecord>::open(config.dir.join("acceptor.log"));

        let mut rounds = BTreeMap::new();
        for record in decided_log.replay() {
            let round = rounds
                .entry(record.instance)
                .or_insert_with(|| Round::new(record.instance));
            round.decided = Some(record.value);
            round.executed = record.executed;
        }
        for record in acceptor_log.replay() {
            let round = rounds
                .entry(record.instance)
                .or_insert_with(|| Round::new(record.instance));
            round.promised = record.promised;
            round.accepted = record.accepted;
        }

        let highest_executed = rounds
            .values()
            .filter(|round| round.executed)
            .map(|round| round.instance)
            .max()
            .unwrap_or(0);
        if !rounds.is_empty() {
            info!(
                "recovered {} rounds, highest executed {}",
                rounds.len(),
                highest_executed
            );
        }

        Engine {
            id: config.id,
            peers: config.peers.clone(),
            proposal_delay: config.proposal_delay,
            rounds,
            highest_executed,
            decided_log,
            acceptor_log,
            state,
        }
    }

    pub fn highest_executed(&self) -> u32 {
        self.highest_executed
    }

    /// Submits `payload` for consensus among `participants` under the next
    /// unused instance number.
    pub fn replicate<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        participants: Vec<NodeId>,
        payload: Vec<u8>,
    ) {
        let instance = self.next_instance();
        info!("proposing command under instance {}", instance);
        let round = self
            .rounds
            .entry(instance)
            .or_insert_with(|| Round::new(instance));
        round.participants = participants;
        round.submitted = Some(payload.clone());
        self.start_proposal(env, transport, instance, Value::Command(payload));
    }

    fn next_instance(&self) -> u32 {
        self.rounds.keys().next_back().copied().unwrap_or(0) + 1
    }

    /// Consensus payload arrived over the transport.
    pub fn receive<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        from: NodeId,
        payload: &[u8],
    ) {
        match Paxos::unpack(payload) {
            Ok(message) => self.dispatch(env, transport, from, message),
            Err(err) => debug!("dropping malformed consensus packet from {}: {}", from, err),
        }
    }

    /// Proposal retry timer fired. A stale timer (instance decided, or no
    /// proposal in flight) is a no-op.
    pub fn retry<E: Env>(&mut self, env: &mut E, transport: &mut Transport, instance: u32) {
        let value = {
            let round = match self.rounds.get_mut(&instance) {
                Some(round) => round,
                None => return,
            };
            if round.decided.is_some() || round.proposal.is_none() {
                return;
            }
            round.backoff *= 1.0 + rand::random::<f32>() / 2.0;
            round.value.clone().unwrap_or(Value::Noop)
        };
        debug!("instance {} still unresolved, retrying", instance);
        self.start_proposal(env, transport, instance, value);
    }

    /// Executes whatever became ready and re-initiates any gap repairs.
    /// Runs after recovery and after every decision.
    pub fn catch_up<E: Env>(&mut self, env: &mut E, transport: &mut Transport) {
        self.execute_ready();
        self.fill_gaps(env, transport);
    }

    fn dispatch<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        from: NodeId,
        message: Paxos,
    ) {
        trace!("received {:?} from {}", message, from);
        match message.kind {
            Kind::Prepare => self.handle_prepare(env, transport, from, message),
            Kind::Promise => self.handle_promise(env, transport, from, message),
            Kind::Accept => self.handle_accept(env, transport, from, message),
            Kind::Accepted => self.handle_accepted(env, transport, from, message),
            Kind::Decision => self.handle_decision(env, transport, message),
        }
    }

    /// Phase 1: bid for the instance with a ballot above everything this
    /// node has proposed or promised, and re-arm the retry timer.
    fn start_proposal<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        instance: u32,
        value: Value,
    ) {
        let id = self.id;
        let (message, participants, delay) = {
            let round = self
                .rounds
                .entry(instance)
                .or_insert_with(|| Round::new(instance));
            if round.decided.is_some() {
                return;
            }
            if round.participants.is_empty() {
                round.participants = self.peers.clone();
            }
            let proposal = match round.proposal.into_iter().chain(round.promised).max() {
                Some(base) => base.bump(id),
                None => ProposalNumber::first(id),
            };
            round.proposal = Some(proposal);
            round.value = Some(value.clone());
            round.highest_accepted = None;
            round.promised_by.clear();
            round.accepted_by.clear();
            let message = Paxos {
                kind: Kind::Prepare,
                instance,
                proposal: proposal.as_u32(),
                body: value.encode(),
            };
            let delay = self.proposal_delay.mul_f32(round.backoff);
            (message, round.participants.clone(), delay)
        };
        debug!(
            "instance {} phase 1 under proposal {}",
            instance, message.proposal
        );
        env.after(delay, Task::Propose { instance });
        self.broadcast(env, transport, &participants, message);
    }

    fn handle_prepare<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        from: NodeId,
        message: Paxos,
    ) {
        let hint = match Value::decode(&message.body) {
            Ok(value) => value,
            Err(err) => {
                debug!("dropping prepare with malformed body from {}: {}", from, err);
                return;
            }
        };
        let proposal = ProposalNumber::from_u32(message.proposal);
        let instance = message.instance;
        let (record, body) = {
            let round = self
                .rounds
                .entry(instance)
                .or_insert_with(|| Round::new(instance));
            match round.promised {
                Some(promised) if proposal <= promised => {
                    trace!(
                        "instance {}: ignoring prepare {} under promise {}",
                        instance,
                        proposal.as_u32(),
                        promised.as_u32()
                    );
                    return;
                }
                _ => (),
            }
            round.promised = Some(proposal);
            let body = match &round.accepted {
                Some((number, value)) => Promise {
                    accepted_proposal: Some(number.as_u32()),
                    value: value.clone(),
                },
                None => Promise {
                    accepted_proposal: None,
                    value: hint,
                },
            };
            let record = AcceptorRecord {
                instance,
                promised: round.promised,
                accepted: round.accepted.clone(),
            };
            (record, body)
        };
        // The promise must be on disk before it is on the wire.
        self.acceptor_log.append(&record);
        let reply = Paxos {
            kind: Kind::Promise,
            instance,
            proposal: proposal.as_u32(),
            body: body.encode(),
        };
        self.send_to(env, transport, from, reply);
    }

    fn handle_promise<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        from: NodeId,
        message: Paxos,
    ) {
        let promise = match Promise::decode(&message.body) {
            Ok(promise) => promise,
            Err(err) => {
                debug!("dropping malformed promise from {}: {}", from, err);
                return;
            }
        };
        let proposal = ProposalNumber::from_u32(message.proposal);
        let instance = message.instance;
        let (value, targets) = {
            let round = match self.rounds.get_mut(&instance) {
                Some(round) => round,
                None => return,
            };
            // Stale: already decided, or this node has moved to a newer
            // ballot of its own.
            if round.decided.is_some() || round.proposal != Some(proposal) {
                return;
            }
            // Phase 2 is already underway with a fixed value; a straggler
            // promise must not adopt a different one.
            if round.promised_by.len() >= round.quorum() {
                return;
            }
            if !round.promised_by.insert(from) {
                return;
            }
            if let Some(number) = promise.accepted_proposal {
                round.observe_accepted(ProposalNumber::from_u32(number), promise.value);
            }
            if round.promised_by.len() != round.quorum() {
                return;
            }
            let value = round
                .value
                .clone()
                .expect("[INTERNAL ERROR]: proposing without a value");
            (value, round.promised_by.iter().copied().collect::<Vec<_>>())
        };
        debug!("instance {}: quorum promised, entering phase 2", instance);
        let message = Paxos {
            kind: Kind::Accept,
            instance,
            proposal: proposal.as_u32(),
            body: value.encode(),
        };
        self.broadcast(env, transport, &targets, message);
    }

    fn handle_accept<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        from: NodeId,
        message: Paxos,
    ) {
        let value = match Value::decode(&message.body) {
            Ok(value) => value,
            Err(err) => {
                debug!("dropping accept with malformed body from {}: {}", from, err);
                return;
            }
        };
        let proposal = ProposalNumber::from_u32(message.proposal);
        let instance = message.instance;
        let record = {
            let round = self
                .rounds
                .entry(instance)
                .or_insert_with(|| Round::new(instance));
            match round.promised {
                Some(promised) if proposal < promised => {
                    trace!(
                        "instance {}: ignoring accept {} under promise {}",
                        instance,
                        proposal.as_u32(),
                        promised.as_u32()
                    );
                    return;
                }
                _ => (),
            }
            // A decided slot only ever re-accepts its decided value.
            if let Some(decided) = &round.decided {
                if *decided != value {
                    trace!("instance {}: accept conflicts with decision", instance);
                    return;
                }
            }
            round.promised = Some(proposal);
            round.accepted = Some((proposal, value));
            AcceptorRecord {
                instance,
                promised: round.promised,
                accepted: round.accepted.clone(),
            }
        };
        self.acceptor_log.append(&record);
        let reply = Paxos {
            kind: Kind::Accepted,
            instance,
            proposal: proposal.as_u32(),
            body: Vec::new(),
        };
        self.send_to(env, transport, from, reply);
    }

    fn handle_accepted<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        from: NodeId,
        message: Paxos,
    ) {
        let proposal = ProposalNumber::from_u32(message.proposal);
        let instance = message.instance;
        let (value, participants) = {
            let round = match self.rounds.get_mut(&instance) {
                Some(round) => round,
                None => return,
            };
            if round.decided.is_some() || round.proposal != Some(proposal) {
                return;
            }
            if !round.accepted_by.insert(from) {
                return;
            }
            if round.accepted_by.len() != round.quorum() {
                return;
            }
            let value = round
                .value
                .clone()
                .expect("[INTERNAL ERROR]: accepted without a value");
            (value, round.participants.clone())
        };
        // The decision goes to every participant, not only the quorum.
        let message = Paxos {
            kind: Kind::Decision,
            instance,
            proposal: proposal.as_u32(),
            body: value.encode(),
        };
        self.broadcast(env, transport, &participants, message);
        // The loopback already recorded the decision if this node is a
        // participant; this is the deciding step otherwise.
        self.decide(env, transport, instance, value);
    }

    fn handle_decision<E: Env>(&mut self, env: &mut E, transport: &mut Transport, message: Paxos) {
        match Value::decode(&message.body) {
            Ok(value) => self.decide(env, transport, message.instance, value),
            Err(err) => debug!("dropping decision with malformed body: {}", err),
        }
    }

    fn decide<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        instance: u32,
        value: Value,
    ) {
        let mut resubmit = None;
        let fresh = {
            let round = self
                .rounds
                .entry(instance)
                .or_insert_with(|| Round::new(instance));
            if round.decided.is_some() {
                // Agreement: the first decision for an instance is final.
                false
            } else {
                round.decided = Some(value.clone());
                if let Some(payload) = round.submitted.take() {
                    let lost = match &value {
                        Value::Command(winner) => *winner != payload,
                        Value::Noop => true,
                    };
                    if lost {
                        resubmit = Some((round.participants.clone(), payload));
                    }
                }
                true
            }
        };
        if fresh {
            self.decided_log.append(&DecidedRecord {
                instance,
                value,
                executed: false,
            });
            info!("instance {} decided", instance);
        }
        if let Some((participants, payload)) = resubmit {
            // Lost the race for this slot; the command still has to land.
            info!("instance {} decided against our payload, resubmitting", instance);
            self.replicate(env, transport, participants, payload);
        }
        self.catch_up(env, transport);
    }

    /// Applies the contiguous decided prefix above `highest_executed`,
    /// marking each instance durable-executed before moving on. A failed
    /// apply stops the sweep; the instance stays unexecuted and is retried
    /// on the next decision or restart.
    fn execute_ready(&mut self) {
        loop {
            let next = self.highest_executed + 1;
            let value = match self.rounds.get(&next) {
                Some(round) if round.executed => {
                    self.highest_executed = next;
                    continue;
                }
                Some(round) => match &round.decided {
                    Some(value) => value.clone(),
                    None => break,
                },
                None => break,
            };
            match &value {
                Value::Noop => debug!("instance {} is a no-op", next),
                Value::Command(command) => {
                    if let Err(err) = self.state.apply(next, command) {
                        error!("apply failed for instance {}: {}; will retry", next, err);
                        break;
                    }
                }
            }
            self.decided_log.append(&DecidedRecord {
                instance: next,
                value,
                executed: true,
            });
            self.rounds
                .get_mut(&next)
                .expect("[INTERNAL ERROR]: executed round missing")
                .executed = true;
            self.highest_executed = next;
            info!("executed instance {}", next);
        }
    }

    /// Any decided instance above a missing slot proves the slot exists;
    /// proposing the no-op marker there forces it to a decision, either
    /// discovering the value that was chosen or closing the hole.
    fn fill_gaps<E: Env>(&mut self, env: &mut E, transport: &mut Transport) {
        let max_decided = self
            .rounds
            .values()
            .filter(|round| round.decided.is_some())
            .map(|round| round.instance)
            .max()
            .unwrap_or(0);
        if max_decided <= self.highest_executed + 1 {
            return;
        }
        let missing: Vec<u32> = (self.highest_executed + 1..max_decided)
            .filter(|instance| match self.rounds.get(instance) {
                Some(round) => round.decided.is_none() && round.proposal.is_none(),
                None => true,
            })
            .collect();
        for instance in missing {
            // A nested decision may have closed this hole already.
            let closed = self
                .rounds
                .get(&instance)
                .map_or(false, |round| round.decided.is_some());
            if closed {
                continue;
            }
            info!("filling gap at instance {} with a no-op", instance);
            self.start_proposal(env, transport, instance, Value::Noop);
        }
    }

    fn broadcast<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        participants: &[NodeId],
        message: Paxos,
    ) {
        for &peer in participants {
            self.send_to(env, transport, peer, message.clone());
        }
    }

    fn send_to<E: Env>(
        &mut self,
        env: &mut E,
        transport: &mut Transport,
        to: NodeId,
        message: Paxos,
    ) {
        if to == self.id {
            // Loopback: a node's messages to itself skip the transport.
            self.dispatch(env, transport, to, message);
        } else if let Err(err) = transport.send(env, to, protocol::PAXOS, message.pack()) {
            error!("could not frame consensus packet for {}: {}", to, err);
        }
    }

    #[cfg(test)]
    fn round(&self, instance: u32) -> Option<&Round> {
        self.rounds.get(&instance)
    }
}
