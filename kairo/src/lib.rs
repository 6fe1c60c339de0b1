#![cfg_attr(docsrs, feature(doc_cfg))]
//! Kairo is a durable execution runtime for long-running AI agent
//! sessions.
//!
//! A session is a finite state machine advanced one *step* at a time.
//! Each step decides the next *instruction* (call a model, call a tool,
//! pause for a human, or finish), executes it while streaming partial
//! output to an append-only event log, persists the resulting state,
//! and schedules its successor through a delayed work queue. State
//! survives process death between steps; clients observe progress by
//! subscribing to the event log with resume-from-id replay.
//!
//! The pieces, leaves first: durable state ([`store`]), the replayable
//! event log ([`stream`]), delayed dispatch ([`queue`]), the four
//! instruction executors ([`executor`]), the per-step driver
//! ([`engine`]), and the public surface ([`coordinator`]). The
//! [`runtime`] module wires them together behind explicit init and
//! shutdown.

// Data model
pub mod context;
pub mod event;
pub mod instruction;
pub mod message;
pub mod session;
pub mod usage;

// Components, leaves first
pub mod queue;
pub mod store;
pub mod stream;

pub mod executor;

pub mod coordinator;
pub mod engine;

// Ambient
pub mod config;
pub mod error;
pub mod runtime;

// Re-export the types embedders touch first.
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::AgentRuntime;
