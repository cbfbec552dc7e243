//! Broadcast hub plus a load generator that measures it.
//!
//! The hub relays every message a peer sends to all other attached peers,
//! stamping it with the server time and never echoing it to the sender. The
//! load generator starts a synchronized crowd of virtual users against a hub
//! and reports round-trip latency percentiles and timeout counts.
//!
//! - [`message`] defines the wire messages and the JSON line framing.
//! - [`registry`] is the concurrent map of connection id to delivery channel.
//! - [`hub`] owns the registry and the attach / publish / detach lifecycle.
//! - [`transport`] puts the hub behind TCP (JSON lines) and WebSocket (raw
//!   text) listeners that share one hub.
//! - [`sync`] provides the start and completion gates.
//! - [`latency`] wraps a lock-free concurrent histogram.
//! - [`bench`] holds the load generator, virtual users and hub links.
//! - [`cli`] parses the `hub` and `bench` subcommands.
//!
//! Tests build isolated hubs per test, either in process or behind an
//! ephemeral listener.

pub mod bench;
pub mod cli;
pub mod hub;
pub mod latency;
pub mod message;
pub mod registry;
pub mod sync;
pub mod transport;
