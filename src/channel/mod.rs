//! The channel fabric: a Unix-domain-socket fan-out server, a client with
//! stateful framing, and a channel group that manages a directory of
//! channels with lifecycle ordering guarantees (spec §2 items 2–4).

pub mod client;
pub mod group;
pub mod server;

pub use client::{ChannelClient, ClientEvent, SharedClient};
pub use group::{ChannelDef, ChannelGroup, GroupManifest};
pub use server::{ChannelServer, ClientId, ServerEvent};
