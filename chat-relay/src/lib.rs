//! A line-oriented TCP chat relay.
//!
//! Clients connect, claim a username with `USERNAME:<name>`, and then exchange
//! broadcast and private text or image frames through the relay. Each module
//! owns one responsibility:
//!
//! - [`protocol`] classifies inbound lines and renders outbound frames.
//! - [`registry`] tracks accepted sessions and the usernames they hold.
//! - [`session`] runs one connection from handshake to cleanup and owns its
//!   serialized writer.
//! - [`router`] implements broadcast, private delivery, presence sync and
//!   slash commands on top of the registry.
//! - [`server`] accepts TCP connections and spawns a session task for each.
//! - [`cli`] parses the command line; [`error`] holds the error types.

pub mod cli;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
