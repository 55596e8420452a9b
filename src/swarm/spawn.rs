//! Process spawning (spec §4.10): builds argv/env for a child agent process
//! and launches it detached from the parent's process group.
//!
//! Grounded in `AcpProcess::spawn`'s piped-stdio/`kill_on_drop` shape and
//! `AcpProcess::kill`'s negated-pgid `SIGTERM`, generalized to no stdin (the
//! child is driven over channels, not stdin) and an explicit detached
//! process group so [`crate::swarm::state::cleanup_swarm`] can kill the
//! whole subtree with one signal.

use crate::error::SpawnError;
use crate::identity::Role;
use crate::swarm::discovery::AgentConfig;
use crate::swarm::layout::inbox_name;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// An agent to spawn, as given by the swarm tool's caller. Inline fields
/// always win over a matching discovered [`AgentConfig`].
#[derive(Debug, Clone, Default)]
pub struct AgentDef {
    pub name: String,
    pub role: AgentRole,
    pub swarm: Option<String>,
    pub task: String,
    /// Name of a discovered agent config to pull missing fields from.
    pub agent: Option<String>,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentRole {
    #[default]
    Agent,
    Coordinator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Agent => "agent",
            AgentRole::Coordinator => "coordinator",
        }
    }
}

/// The resolved argv and bookkeeping for one spawn, before launching.
pub struct BuiltArgs {
    pub args: Vec<String>,
    pub tmp_prompt_path: PathBuf,
    pub tmp_dir: PathBuf,
    pub model: Option<String>,
    pub source: Option<crate::swarm::discovery::Source>,
}

/// Resolve `def` against `known` (inline wins), assemble argv, and write the
/// combined system prompt to a mode-0600 file in a fresh temp directory.
pub fn build_agent_args(
    def: &AgentDef,
    known: Option<&HashMap<String, AgentConfig>>,
    prompt_suffix: Option<&str>,
) -> Result<BuiltArgs, SpawnError> {
    let resolved = def
        .agent
        .as_deref()
        .and_then(|name| known.and_then(|k| k.get(name)));

    let system_prompt = def
        .system_prompt
        .clone()
        .or_else(|| resolved.map(|r| r.system_prompt.clone()));
    let Some(system_prompt) = system_prompt else {
        return Err(SpawnError::UnknownAgent(
            def.agent.clone().unwrap_or_else(|| def.name.clone()),
        ));
    };

    let tools = def
        .tools
        .clone()
        .or_else(|| resolved.and_then(|r| r.tools.clone()));
    let model = def
        .model
        .clone()
        .or_else(|| resolved.and_then(|r| r.model.clone()));
    let source = resolved.map(|r| r.source);

    let tmp_dir = std::env::temp_dir().join(format!("pi-swarm-prompt-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&tmp_dir).map_err(SpawnError::PromptFile)?;
    let tmp_prompt_path = tmp_dir.join("system-prompt.md");

    let mut full_prompt = system_prompt;
    if let Some(suffix) = prompt_suffix {
        full_prompt.push('\n');
        full_prompt.push_str(suffix);
    }
    write_prompt_file(&tmp_prompt_path, &full_prompt).map_err(SpawnError::PromptFile)?;

    let mut args = vec![
        "--mode".to_string(),
        "agent".to_string(),
        "--stdio".to_string(),
        "--no-session".to_string(),
    ];
    if let Some(model) = &model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(tools) = &tools {
        args.push("--tools".to_string());
        args.push(tools.join(","));
    }
    args.push("--append-system-prompt".to_string());
    args.push(tmp_prompt_path.to_string_lossy().into_owned());
    args.push(format!("Task: {}", def.task));

    Ok(BuiltArgs {
        args,
        tmp_prompt_path,
        tmp_dir,
        model,
        source,
    })
}

#[cfg(unix)]
fn write_prompt_file(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt as _;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_prompt_file(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// A successfully spawned agent process.
pub struct SpawnedAgent {
    pub child: Child,
    pub pid: u32,
    pub tmp_dir: PathBuf,
    pub model: Option<String>,
    pub source: Option<crate::swarm::discovery::Source>,
}

/// Spawn `def` as a detached child process sharing `group_path`'s channel
/// fabric. Stdio is `[ignored, piped, piped]` — the child is never driven
/// over stdin, only through channels; stdout/stderr are piped so the caller
/// can feed [`crate::swarm::activity`] and capture crash diagnostics.
pub async fn spawn_agent(
    binary: &Path,
    def: &AgentDef,
    group_path: &Path,
    task_dir_path: Option<&Path>,
    cwd: &Path,
    known: Option<&HashMap<String, AgentConfig>>,
    topic_channel: Option<&str>,
) -> Result<SpawnedAgent, SpawnError> {
    let built = build_agent_args(def, known, None)?;

    let mut subscribe = vec!["general".to_string()];
    if let Some(topic) = topic_channel {
        subscribe.push(topic.to_string());
    }

    let mut cmd = Command::new(binary);
    cmd.args(&built.args)
        .current_dir(def.cwd.as_deref().unwrap_or(cwd))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("PI_CHANNELS_GROUP", group_path)
        .env("PI_CHANNELS_INBOX", inbox_name(&def.name))
        .env("PI_CHANNELS_SUBSCRIBE", subscribe.join(","))
        .env("PI_CHANNELS_NAME", &def.name)
        .env("PI_SWARM_AGENT_ROLE", def.role.as_str());
    if let Some(swarm) = &def.swarm {
        cmd.env("PI_SWARM_AGENT_SWARM", swarm);
    }
    if def.role == AgentRole::Coordinator
        && let Some(task_dir) = task_dir_path
    {
        cmd.env("PI_SWARM_TASK_DIR", task_dir);
    }
    detach_process_group(&mut cmd);

    let child = cmd.spawn().map_err(SpawnError::Spawn)?;
    let pid = child.id().unwrap_or(0);

    Ok(SpawnedAgent {
        child,
        pid,
        tmp_dir: built.tmp_dir,
        model: built.model,
        source: built.source,
    })
}

#[cfg(unix)]
fn detach_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach_process_group(_cmd: &mut Command) {}

/// Best-effort removal of the temp prompt directory after the child exits.
pub async fn cleanup_spawn_tmp(tmp_dir: &Path) {
    let _ = tokio::fs::remove_dir_all(tmp_dir).await;
}

/// Signal SIGTERM to the negated pid of a spawned agent's process group —
/// kills the whole subtree the child may have forked, not just the direct
/// child (used by [`crate::swarm::state::cleanup_swarm`]).
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

impl From<Role> for AgentRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Coordinator => AgentRole::Coordinator,
            _ => AgentRole::Agent,
        }
    }
}
