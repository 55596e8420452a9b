//! The TCP bridge: tunnels a local Unix-socket channel to remote peers
//! over TCP, with jittered exponential-backoff reconnect on the client
//! side (spec §4.5–§4.6).

pub mod client;
pub mod server;

pub use client::{BridgeClientEvent, BridgeStatus, TcpBridgeClient};
pub use server::{BridgeServerEvent, PeerId, TcpBridgeServer};
