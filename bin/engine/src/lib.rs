//! runwright engine process.
//!
//! This crate wires the workflow, scheduler and trigger crates to Postgres,
//! Redis and NATS. The binary runs the node executor and the scheduler;
//! embedders with calendar or mailbox providers add event pollers through
//! [`runtime::Engine::spawn_poller`].

pub mod config;
pub mod db;
pub mod error;
pub mod runtime;
