/// Connection and weight based admission control
///
/// Counters are shared by every session task and only ever touched through
/// atomic increments, decrements and compare-and-swap; no lock is held for
/// the lifetime of a session.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Ceilings, all in the "max connections" unit. Zero disables a ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub max_connections: u64,
    pub max_weight: u64,
    /// Accept at most one session for the lifetime of the process
    pub once: bool,
}

/// Why a session was turned away
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    TooManyConnections,
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooManyConnections => write!(f, "exceeding max number of connections"),
            RejectReason::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

/// A session that was not admitted, with the load observed at the time
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason} (connections: {active_connections}, weight: {active_weight})")]
pub struct AdmissionRejected {
    pub reason: RejectReason,
    pub active_connections: u64,
    pub active_weight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    weight: AtomicU64,
    once_taken: AtomicBool,
}

/// Process-wide admission state. Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct AdmissionController {
    config: AdmissionConfig,
    counters: Arc<Counters>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Try to admit a session costing `weight`.
    ///
    /// Counters are incremented first and checked afterwards; a rejected
    /// attempt releases its increment before returning, so the caller only
    /// ever holds counts through an [`AdmissionTicket`].
    pub fn try_admit(&self, weight: u64) -> Result<AdmissionTicket, AdmissionRejected> {
        if self.config.once
            && self
                .counters
                .once_taken
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(AdmissionRejected {
                reason: RejectReason::ShuttingDown,
                active_connections: self.active_connections(),
                active_weight: self.active_weight(),
            });
        }

        let ticket = self.admit(weight);

        let over_connections =
            self.config.max_connections != 0 && ticket.connections > self.config.max_connections;
        let over_weight =
            self.config.max_weight != 0 && ticket.total_weight > self.config.max_weight;

        if over_connections || over_weight {
            let rejected = AdmissionRejected {
                reason: RejectReason::TooManyConnections,
                active_connections: ticket.connections,
                active_weight: ticket.total_weight,
            };
            drop(ticket);
            return Err(rejected);
        }

        Ok(ticket)
    }

    fn admit(&self, weight: u64) -> AdmissionTicket {
        let connections = self.counters.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let total_weight = self.counters.weight.fetch_add(weight, Ordering::SeqCst) + weight;
        AdmissionTicket {
            counters: Arc::clone(&self.counters),
            weight,
            connections,
            total_weight,
            released: false,
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.counters.connections.load(Ordering::SeqCst)
    }

    pub fn active_weight(&self) -> u64 {
        self.counters.weight.load(Ordering::SeqCst)
    }

    /// Whether the single session of once mode has been handed out
    pub fn once_consumed(&self) -> bool {
        self.counters.once_taken.load(Ordering::SeqCst)
    }
}

/// Counts held by one admitted session; released exactly once, on drop at
/// the latest.
#[derive(Debug)]
pub struct AdmissionTicket {
    counters: Arc<Counters>,
    weight: u64,
    connections: u64,
    total_weight: u64,
    released: bool,
}

impl AdmissionTicket {
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Connection count right after this session was admitted
    pub fn connections_at_admission(&self) -> u64 {
        self.connections
    }

    /// Aggregate weight right after this session was admitted
    pub fn weight_at_admission(&self) -> u64 {
        self.total_weight
    }

    /// Give the counts back and return the remaining (connections, weight)
    pub fn release(mut self) -> (u64, u64) {
        self.release_counts()
    }

    fn release_counts(&mut self) -> (u64, u64) {
        if self.released {
            return (
                self.counters.connections.load(Ordering::SeqCst),
                self.counters.weight.load(Ordering::SeqCst),
            );
        }
        self.released = true;
        let connections = self.counters.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        let weight = self.counters.weight.fetch_sub(self.weight, Ordering::SeqCst) - self.weight;
        (connections, weight)
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release_counts();
    }
}
