//! Swarm state & lifecycle (spec §4.11): a generation-guarded singleton
//! tracking every agent's bounded finite-state machine.
//!
//! Grounded in `agent::worker::Worker::can_transition_to`/`transition_to`'s
//! `matches!`-over-tuples shape, generalized from 2 states to the 6 here, and
//! in `AgentDeps::links`/`routing`'s `ArcSwap` singleton-with-generation
//! pattern.

use crate::channel::client::SharedClient;
use crate::swarm::spawn::SpawnedAgent;
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Starting,
    Running,
    Done,
    Blocked,
    Crashed,
    Disconnected,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Done | AgentStatus::Crashed | AgentStatus::Disconnected
        )
    }

    /// The transition table from spec §4.11: which `(from, to)` pairs are
    /// allowed. `done`/`crashed`/`disconnected` are sinks.
    fn can_transition_to(&self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Done)
                | (Starting, Blocked)
                | (Starting, Crashed)
                | (Starting, Disconnected)
                | (Running, Done)
                | (Running, Blocked)
                | (Running, Crashed)
                | (Running, Disconnected)
                | (Blocked, Running)
                | (Blocked, Done)
                | (Blocked, Crashed)
                | (Blocked, Disconnected)
        )
    }
}

/// Runtime view of one agent in the current swarm. Never removed from
/// [`SwarmStateInner::agents`] once inserted — the map doubles as a
/// post-mortem record.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub role: crate::swarm::spawn::AgentRole,
    pub swarm: Option<String>,
    pub task: String,
    pub status: AgentStatus,
    pub pid: Option<u32>,
    pub done_summary: Option<String>,
    pub blocker_description: Option<String>,
    pub progress_phase: Option<String>,
    pub progress_percent: Option<u8>,
    pub progress_detail: Option<String>,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, role: crate::swarm::spawn::AgentRole, swarm: Option<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            swarm,
            task: task.into(),
            status: AgentStatus::Starting,
            pid: None,
            done_summary: None,
            blocker_description: None,
            progress_phase: None,
            progress_percent: None,
            progress_detail: None,
        }
    }
}

/// Optional fields merged onto an [`AgentInfo`] alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub done_summary: Option<String>,
    pub blocker_description: Option<String>,
    pub progress_phase: Option<String>,
    pub progress_percent: Option<u8>,
    pub progress_detail: Option<String>,
}

/// The guts of the singleton, swapped as a whole on every [`set_swarm_state`].
pub struct SwarmStateInner {
    pub group: Option<Arc<crate::channel::group::ChannelGroup>>,
    pub group_path: PathBuf,
    pub agents: Mutex<HashMap<String, AgentInfo>>,
    pub queen_clients: Mutex<HashMap<String, SharedClient>>,
    pub task_dir_path: Option<PathBuf>,
    pub spawned_pids: Mutex<HashMap<String, u32>>,
}

impl SwarmStateInner {
    pub fn new(group: Option<Arc<crate::channel::group::ChannelGroup>>, group_path: PathBuf, task_dir_path: Option<PathBuf>) -> Self {
        Self {
            group,
            group_path,
            agents: Mutex::new(HashMap::new()),
            queen_clients: Mutex::new(HashMap::new()),
            task_dir_path,
            spawned_pids: Mutex::new(HashMap::new()),
        }
    }
}

/// Hooks installed by the swarm tool (spec §4.12 step 4), each gated on the
/// generation captured at install time.
#[derive(Clone, Default)]
pub struct StateCallbacks {
    pub on_agent_done: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_blocker: Option<Arc<dyn Fn(String, String) + Send + Sync>>,
    pub on_nudge: Option<Arc<dyn Fn(String, String) + Send + Sync>>,
    pub on_all_done: Option<Arc<dyn Fn() + Send + Sync>>,
}

static STATE: ArcSwapOption<SwarmStateInner> = ArcSwapOption::const_empty();
static CALLBACKS: ArcSwapOption<StateCallbacks> = ArcSwapOption::const_empty();
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// The generation stamped on the currently active state, or 0 if none.
pub fn current_generation() -> u64 {
    GENERATION.load(Ordering::SeqCst)
}

/// The currently active state, if any.
pub fn current_state() -> Option<Arc<SwarmStateInner>> {
    STATE.load_full()
}

/// Atomically replace the singleton and bump the generation so prior
/// captures become stale. Returns the new generation.
pub fn set_swarm_state(inner: SwarmStateInner, callbacks: StateCallbacks) -> u64 {
    STATE.store(Some(Arc::new(inner)));
    CALLBACKS.store(Some(Arc::new(callbacks)));
    GENERATION.fetch_add(1, Ordering::SeqCst)
}

/// Clear the singleton without bumping the generation (used by
/// [`cleanup_swarm`], which is the terminal act for a generation, not the
/// start of a new one).
fn clear_swarm_state() {
    STATE.store(None);
    CALLBACKS.store(None);
}

#[cfg(any(test, feature = "test-util"))]
pub fn reset() {
    clear_swarm_state();
    GENERATION.store(0, Ordering::SeqCst);
}

/// Register an agent in `starting` state. No-op (returns false) if a swarm
/// isn't active.
pub async fn register_agent(info: AgentInfo) -> bool {
    let Some(state) = current_state() else {
        return false;
    };
    state.agents.lock().await.insert(info.name.clone(), info);
    true
}

/// Apply a validated status transition, merging `fields`. Returns `false`
/// (state unchanged) if the agent is unknown or the transition is invalid —
/// this is intentional: late callbacks from dying children must not be able
/// to undo a terminal marking.
pub async fn update_agent_status(name: &str, next: AgentStatus, fields: StatusFields) -> bool {
    let Some(state) = current_state() else {
        return false;
    };

    let all_terminal = {
        let mut agents = state.agents.lock().await;
        let Some(agent) = agents.get_mut(name) else {
            return false;
        };
        if !agent.status.can_transition_to(next) {
            return false;
        }
        agent.status = next;
        if fields.done_summary.is_some() {
            agent.done_summary = fields.done_summary;
        }
        if fields.blocker_description.is_some() {
            agent.blocker_description = fields.blocker_description;
        }
        if fields.progress_phase.is_some() {
            agent.progress_phase = fields.progress_phase;
        }
        if fields.progress_percent.is_some() {
            agent.progress_percent = fields.progress_percent;
        }
        if fields.progress_detail.is_some() {
            agent.progress_detail = fields.progress_detail;
        }
        agents.values().all(|a| a.status.is_terminal())
    };

    if let Some(name) = matches!(next, AgentStatus::Done).then(|| name.to_string())
        && let Some(cb) = CALLBACKS.load_full()
        && let Some(on_agent_done) = &cb.on_agent_done
    {
        on_agent_done(name);
    }

    if all_terminal
        && let Some(cb) = CALLBACKS.load_full()
        && let Some(on_all_done) = &cb.on_all_done
    {
        on_all_done();
    }

    true
}

/// Merge `fields` onto an agent without requiring a status transition — used
/// by progress updates, which carry no status change of their own.
pub async fn update_agent_fields(name: &str, fields: StatusFields) -> bool {
    let Some(state) = current_state() else {
        return false;
    };
    let mut agents = state.agents.lock().await;
    let Some(agent) = agents.get_mut(name) else {
        return false;
    };
    if fields.done_summary.is_some() {
        agent.done_summary = fields.done_summary;
    }
    if fields.blocker_description.is_some() {
        agent.blocker_description = fields.blocker_description;
    }
    if fields.progress_phase.is_some() {
        agent.progress_phase = fields.progress_phase;
    }
    if fields.progress_percent.is_some() {
        agent.progress_percent = fields.progress_percent;
    }
    if fields.progress_detail.is_some() {
        agent.progress_detail = fields.progress_detail;
    }
    true
}

/// Best-effort teardown: SIGTERM every spawned process group, stop the
/// channel group (removing its directory), clear the singleton. Idempotent.
pub async fn cleanup_swarm() {
    let Some(state) = current_state() else {
        return;
    };

    let pids: Vec<u32> = state.spawned_pids.lock().await.values().copied().collect();
    for pid in pids {
        crate::swarm::spawn::kill_process_group(pid);
    }

    if let Some(group) = &state.group {
        group.stop(true).await;
    }

    clear_swarm_state();
}

/// Record the pid a just-spawned agent is running as, so [`cleanup_swarm`]
/// can signal it later.
pub async fn record_spawned_pid(name: &str, spawned: &SpawnedAgent) {
    if let Some(state) = current_state() {
        state
            .spawned_pids
            .lock()
            .await
            .insert(name.to_string(), spawned.pid);
    }
}

/// Broadcast a wrap-up instruction, then poll every 2 seconds until every
/// agent is terminal, the state has been replaced underneath us (generation
/// mismatch — abort without cleanup), or `timeout` elapses (then clean up
/// unconditionally).
pub async fn graceful_shutdown<F, Fut>(send_instruct: F, timeout: std::time::Duration)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let captured_generation = current_generation();
    if current_state().is_none() {
        return;
    }

    send_instruct().await;

    let poll_interval = std::time::Duration::from_secs(2);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if current_generation() != captured_generation {
            return;
        }
        let Some(state) = current_state() else {
            return;
        };
        let all_terminal = state
            .agents
            .lock()
            .await
            .values()
            .all(|a| a.status.is_terminal());
        if all_terminal {
            cleanup_swarm().await;
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            cleanup_swarm().await;
            return;
        }
        tokio::time::sleep(poll_interval.min(deadline.saturating_duration_since(tokio::time::Instant::now()).max(std::time::Duration::from_millis(1)))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state(path: &std::path::Path) -> SwarmStateInner {
        SwarmStateInner::new(None, path.to_path_buf(), None)
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_unchanged() {
        reset();
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g1")), StateCallbacks::default());
        register_agent(AgentInfo::new("a1", crate::swarm::spawn::AgentRole::Agent, None, "task")).await;

        assert!(update_agent_status("a1", AgentStatus::Crashed, StatusFields::default()).await);
        let ok = update_agent_status("a1", AgentStatus::Running, StatusFields::default()).await;
        assert!(!ok);

        let state = current_state().unwrap();
        let agents = state.agents.lock().await;
        assert_eq!(agents.get("a1").unwrap().status, AgentStatus::Crashed);
    }

    #[tokio::test]
    async fn blocked_can_return_to_running() {
        reset();
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g2")), StateCallbacks::default());
        register_agent(AgentInfo::new("a1", crate::swarm::spawn::AgentRole::Agent, None, "task")).await;

        assert!(update_agent_status("a1", AgentStatus::Running, StatusFields::default()).await);
        assert!(update_agent_status("a1", AgentStatus::Blocked, StatusFields::default()).await);
        assert!(update_agent_status("a1", AgentStatus::Running, StatusFields::default()).await);
    }

    #[tokio::test]
    async fn on_all_done_fires_exactly_once_when_last_agent_terminates() {
        reset();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_cb = fired.clone();
        let callbacks = StateCallbacks {
            on_all_done: Some(std::sync::Arc::new(move || {
                fired_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..Default::default()
        };
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g3")), callbacks);
        register_agent(AgentInfo::new("a1", crate::swarm::spawn::AgentRole::Agent, None, "t")).await;
        register_agent(AgentInfo::new("a2", crate::swarm::spawn::AgentRole::Agent, None, "t")).await;

        update_agent_status("a1", AgentStatus::Done, StatusFields::default()).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);
        update_agent_status("a2", AgentStatus::Crashed, StatusFields::default()).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generation_bumps_on_replace_and_stale_callbacks_can_detect_it() {
        reset();
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g4")), StateCallbacks::default());
        let g1 = current_generation();

        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g5")), StateCallbacks::default());
        let g2 = current_generation();

        assert_ne!(g1, g2);
        assert_ne!(g1, current_generation());
    }

    #[tokio::test]
    async fn graceful_shutdown_preempted_by_new_state_does_not_clean_up() {
        reset();
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g6")), StateCallbacks::default());
        register_agent(AgentInfo::new("a1", crate::swarm::spawn::AgentRole::Agent, None, "t")).await;

        let shutdown = tokio::spawn(async {
            graceful_shutdown(
                || async {},
                std::time::Duration::from_secs(30),
            )
            .await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g7")), StateCallbacks::default());
        let new_generation = current_generation();

        shutdown.await.unwrap();
        assert_eq!(current_generation(), new_generation);
        assert!(current_state().is_some());
    }

    #[tokio::test]
    async fn update_agent_fields_merges_without_changing_status() {
        reset();
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g9")), StateCallbacks::default());
        register_agent(AgentInfo::new("a1", crate::swarm::spawn::AgentRole::Agent, None, "t")).await;
        update_agent_status("a1", AgentStatus::Running, StatusFields::default()).await;

        let ok = update_agent_fields(
            "a1",
            StatusFields {
                progress_phase: Some("scanning".to_string()),
                progress_percent: Some(40),
                ..Default::default()
            },
        )
        .await;
        assert!(ok);

        let state = current_state().unwrap();
        let agents = state.agents.lock().await;
        let agent = agents.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.progress_percent, Some(40));
    }

    #[tokio::test]
    async fn graceful_shutdown_times_out_and_cleans_up() {
        reset();
        set_swarm_state(fresh_state(std::path::Path::new("/tmp/g8")), StateCallbacks::default());
        register_agent(AgentInfo::new("a1", crate::swarm::spawn::AgentRole::Agent, None, "t")).await;

        graceful_shutdown(|| async {}, std::time::Duration::from_millis(10)).await;
        assert!(current_state().is_none());
    }
}
