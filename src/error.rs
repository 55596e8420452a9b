//! Top-level error types for the channel fabric and swarm coordinator.

use std::path::PathBuf;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: PathBuf,
        source: config::ConfigError,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Framing/protocol errors (wire format decoding, message validation).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds max size {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Channel server/client/group lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel already started")]
    AlreadyStarted,

    #[error("client already connected")]
    AlreadyConnected,

    #[error("client not connected")]
    NotConnected,

    #[error("socket already in use: {0}")]
    SocketInUse(PathBuf),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("channel group not started")]
    GroupNotStarted,

    #[error("io error on channel: {0}")]
    Io(#[from] std::io::Error),
}

/// TCP bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is not running")]
    NotRunning,

    #[error("bridge already running")]
    AlreadyRunning,

    #[error("io error on bridge: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Swarm state-machine and coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("a swarm is already active")]
    AlreadyActive,

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("agents may not spawn swarms")]
    RoleForbidden,

    #[error("no agents specified")]
    NoAgents,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Agent discovery (frontmatter parsing, directory scanning) errors.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("io error while discovering agents: {0}")]
    Io(#[from] std::io::Error),
}

/// Child agent process spawning errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("unknown agent '{0}' and no inline system prompt/description given")]
    UnknownAgent(String),

    #[error("failed to write system prompt file: {0}")]
    PromptFile(std::io::Error),

    #[error("failed to spawn agent process: {0}")]
    Spawn(std::io::Error),
}
