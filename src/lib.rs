//! ttyjail: process containment and admission control for multiplexed
//! terminal sessions
//!
//! Every session runs one command inside a per-command cgroup container, in
//! its own memory-limited sub-scope and a fresh (or joined) namespace set,
//! and only after the admission controller has accepted it.

pub mod admission;
pub mod cancel;
pub mod cgroup;
pub mod cli;
pub mod command;
pub mod config;
pub mod container;
pub mod limits;
pub mod namespace;
pub mod session;
pub mod spawn;
pub mod types;
