//! Process identity (spec §4.8): a process-wide, read-once view of the
//! environment a channel-fabric process was started with.
//!
//! `Identity::current()` is a singleton — constructed once from the process
//! environment and cached. Tests that need a fresh view across env var
//! changes must call [`reset`] first.

use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Coordination role a process identifies as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Queen,
    Coordinator,
    Agent,
}

impl Role {
    fn parse(raw: &str) -> Self {
        match raw {
            "coordinator" => Role::Coordinator,
            "agent" => Role::Agent,
            _ => Role::Queen,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Queen => "queen",
            Role::Coordinator => "coordinator",
            Role::Agent => "agent",
        }
    }
}

/// A process's identity, read once from the environment at construction.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub role: Role,
    pub swarm: Option<String>,
}

static IDENTITY: ArcSwapOption<Identity> = ArcSwapOption::const_empty();

/// Build (or return the cached) process identity from environment variables.
///
/// `name` resolves `PI_CHANNELS_NAME`, falling back to the legacy
/// `PI_SWARM_AGENT_NAME`, then `"queen"`. `role` resolves
/// `PI_SWARM_AGENT_ROLE`, defaulting to `"queen"`. `swarm` resolves
/// `PI_SWARM_AGENT_SWARM`, which may be absent.
pub fn current() -> Arc<Identity> {
    if let Some(identity) = IDENTITY.load_full() {
        return identity;
    }
    let identity = Arc::new(build_from_env());
    IDENTITY.store(Some(identity.clone()));
    identity
}

fn build_from_env() -> Identity {
    let name = std::env::var("PI_CHANNELS_NAME")
        .or_else(|_| std::env::var("PI_SWARM_AGENT_NAME"))
        .unwrap_or_else(|_| "queen".to_string());
    let role = std::env::var("PI_SWARM_AGENT_ROLE")
        .map(|r| Role::parse(&r))
        .unwrap_or(Role::Queen);
    let swarm = std::env::var("PI_SWARM_AGENT_SWARM").ok();
    Identity { name, role, swarm }
}

/// Clear the cached identity singleton. Test-only: production code never
/// needs to observe an identity change within a process lifetime.
#[cfg(any(test, feature = "test-util"))]
pub fn reset() {
    IDENTITY.store(None);
}

/// The channel group directory path for a child process, from
/// `PI_CHANNELS_GROUP`.
pub fn channel_group_path() -> Option<std::path::PathBuf> {
    std::env::var_os("PI_CHANNELS_GROUP").map(std::path::PathBuf::from)
}

/// This process's own inbox channel name, from `PI_CHANNELS_INBOX`.
pub fn inbox_channel() -> Option<String> {
    std::env::var("PI_CHANNELS_INBOX").ok()
}

/// Channels to subscribe to on start, from the comma-separated
/// `PI_CHANNELS_SUBSCRIBE`. Defaults to `["general"]`. Entries are trimmed;
/// empty entries are dropped.
pub fn subscribe_channels() -> Vec<String> {
    match std::env::var("PI_CHANNELS_SUBSCRIBE") {
        Ok(raw) => {
            let entries: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if entries.is_empty() {
                vec!["general".to_string()]
            } else {
                entries
            }
        }
        Err(_) => vec!["general".to_string()],
    }
}

/// The task-directory path for a coordinator child, from `PI_SWARM_TASK_DIR`.
pub fn task_dir_path() -> Option<std::path::PathBuf> {
    std::env::var_os("PI_SWARM_TASK_DIR").map(std::path::PathBuf::from)
}
