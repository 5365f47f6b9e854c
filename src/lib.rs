//! codexec library
//!
//! Sandboxed code execution over a message broker:
//! - Workers consume per-language job queues and run each job under nsjail
//! - Results fan out to every hub replica
//! - The hub routes each result to the websocket client that submitted it

pub mod bus;
pub mod checker;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod hub;
pub mod model;
pub mod sandbox;
pub mod worker;
