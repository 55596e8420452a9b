//! `pi_swarm`: a Unix-domain-socket channel fabric and a multi-agent swarm
//! coordinator built on top of it.
//!
//! The crate is split into two halves:
//!
//! - [`channel`] and [`bridge`] implement the channel fabric: fan-out
//!   Unix-socket servers/clients, channel groups, and a TCP bridge for
//!   tunneling a channel across a network boundary.
//! - [`identity`] and [`swarm`] implement the coordinator: process identity,
//!   agent discovery, spawning, the generation-guarded state machine,
//!   activity/usage aggregation, and notification dispatch.
//!
//! [`config`] and [`error`] are the ambient stack shared by both halves.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod framing;
pub mod identity;
pub mod swarm;

pub use config::ChannelsConfig;
pub use error::{Error, Result};
pub use framing::{FrameDecoder, Message};
