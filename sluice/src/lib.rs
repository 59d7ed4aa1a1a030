//! `sluice` is a protocol-agnostic middleware gateway for IoT traffic.
//! Peers connect over TCP or UDP; the gateway identifies the application
//! protocol from the first bytes on the wire, tracks per-connection
//! sessions under admission control, and answers with wire-exact replies
//! for the protocol subset it speaks.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod congestion;
pub mod detect;
pub mod error;
pub mod logging;
pub mod net;
pub mod pool;
pub mod proto;
pub mod queue;
pub mod session;
pub mod time;
