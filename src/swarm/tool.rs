//! Swarm tool entry point (spec §4.12): the public surface a host agent
//! calls to spawn and coordinate a swarm, in async (fire-and-forget) or
//! blocking (run-to-completion) mode.

use crate::channel::client::{ChannelClient, ClientEvent, SharedClient};
use crate::channel::group::ChannelDef;
use crate::error::SwarmError;
use crate::identity::Role;
use crate::swarm::activity::{ActivityEvent, ActivityStore, Usage};
use crate::swarm::discovery::{discover_agents, DiscoveryScope, Source};
use crate::swarm::layout::{self, AgentChannelSpec};
use crate::swarm::spawn::{self, AgentDef};
use crate::swarm::state::{self, AgentInfo, AgentStatus, StateCallbacks, StatusFields, SwarmStateInner};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;

/// A task-directory scaffold to materialize alongside a swarm (spec §4.12
/// step 3). Content is opaque markdown; this crate only writes it to disk.
#[derive(Debug, Clone)]
pub struct TaskDirSpec {
    pub path: PathBuf,
    pub overview: Option<String>,
}

/// Parameters recognized by the swarm tool entry point.
#[derive(Debug, Clone, Default)]
pub struct SwarmToolParams {
    pub agents: Vec<AgentDef>,
    pub task_dir: Option<TaskDirSpec>,
    pub chain: Vec<AgentDef>,
    pub blocking: Option<bool>,
    pub concurrency: Option<usize>,
}

/// Auto-select blocking vs async per spec §4.12: explicit override wins;
/// else a non-empty chain blocks; else a single agent with no task
/// directory blocks; else async.
pub fn should_block(params: &SwarmToolParams) -> bool {
    if let Some(explicit) = params.blocking {
        return explicit;
    }
    if !params.chain.is_empty() {
        return true;
    }
    params.agents.len() == 1 && params.task_dir.is_none()
}

/// Outcome of a single agent's run in blocking mode.
#[derive(Debug, Clone)]
pub struct SingleResult {
    pub agent: String,
    pub agent_source: Option<Source>,
    pub task: String,
    pub exit_code: Option<i32>,
    pub messages: Vec<String>,
    pub stderr: String,
    pub usage: Usage,
    pub model: Option<String>,
    pub error_message: Option<String>,
    pub step: Option<usize>,
}

pub enum BlockingOutcome {
    Single(SingleResult),
    Parallel(Vec<SingleResult>),
    Chain(Vec<SingleResult>),
}

/// Description returned immediately by the async path.
pub struct AsyncLaunch {
    pub swarm_id: String,
    pub group_path: PathBuf,
    pub agent_names: Vec<String>,
}

const STARTING_TIMEOUT: std::time::Duration = crate::config::DEFAULT_REGISTER_TIMEOUT;

/// Run the swarm tool. `binary` is the opaque child agent executable;
/// `caller_role` is this process's own [`Role`] (agents may not launch an
/// async swarm); `cwd` scopes agent-discovery and relative working
/// directories.
pub async fn run_swarm_tool(
    binary: &Path,
    caller_role: Role,
    cwd: &Path,
    base_dir: &Path,
    activity: Arc<ActivityStore>,
    params: SwarmToolParams,
) -> Result<ToolOutcome, SwarmError> {
    if params.agents.is_empty() && params.chain.is_empty() {
        return Err(SwarmError::NoAgents);
    }

    let blocking = should_block(&params);

    if !blocking && caller_role == Role::Agent {
        return Err(SwarmError::RoleForbidden);
    }

    if blocking {
        let outcome = run_blocking(binary, cwd, activity, params).await?;
        Ok(ToolOutcome::Blocking(outcome))
    } else {
        let launch = run_async(binary, cwd, base_dir, activity, params).await?;
        Ok(ToolOutcome::Async(launch))
    }
}

pub enum ToolOutcome {
    Async(AsyncLaunch),
    Blocking(BlockingOutcome),
}

async fn run_async(
    binary: &Path,
    cwd: &Path,
    base_dir: &Path,
    activity: Arc<ActivityStore>,
    params: SwarmToolParams,
) -> Result<AsyncLaunch, SwarmError> {
    if let Some(existing) = state::current_state() {
        let all_terminal = existing
            .agents
            .lock()
            .await
            .values()
            .all(|a| a.status.is_terminal());
        if !all_terminal {
            return Err(SwarmError::AlreadyActive);
        }
        state::cleanup_swarm().await;
        activity.clear_activity(None).await;
    }

    let discovered = discover_agents(cwd, DiscoveryScope::Both).await.ok();
    let known = discovered.as_ref().map(|d| &d.agents);

    let swarm_id = uuid::Uuid::new_v4().to_string();
    let group_path = layout::group_path(base_dir, &swarm_id);

    let channel_specs: Vec<AgentChannelSpec> = params
        .agents
        .iter()
        .map(|a| AgentChannelSpec {
            name: a.name.clone(),
            swarm: a.swarm.clone(),
        })
        .collect();
    let (group, topics) = layout::create_swarm_channel_group(base_dir, &swarm_id, &channel_specs);
    let group = Arc::new(group);
    group.start().await.map_err(SwarmError::Channel)?;

    if let Some(task_dir) = &params.task_dir {
        let _ = tokio::fs::create_dir_all(&task_dir.path).await;
        if let Some(overview) = &task_dir.overview {
            let _ = tokio::fs::write(task_dir.path.join("OVERVIEW.md"), overview).await;
        }
    }

    let mut queen_clients: std::collections::HashMap<String, SharedClient> =
        std::collections::HashMap::new();
    for name in [layout::GENERAL_CHANNEL, layout::QUEEN_INBOX] {
        let client = Arc::new(ChannelClient::new(group.socket_path(name)));
        client.connect().await.map_err(SwarmError::Channel)?;
        queen_clients.insert(name.to_string(), client);
    }
    for agent in &params.agents {
        let inbox = layout::inbox_name(&agent.name);
        let client = Arc::new(ChannelClient::new(group.socket_path(&inbox)));
        client.connect().await.map_err(SwarmError::Channel)?;
        queen_clients.insert(inbox, client);
    }

    let parent_queen_inbox = parent_queen_inbox_client().await;

    let mut inner = SwarmStateInner::new(Some(group.clone()), group_path.clone(), params.task_dir.as_ref().map(|t| t.path.clone()));
    for client in queen_clients.values() {
        inner
            .queen_clients
            .get_mut()
            .insert(client.socket_path().to_string_lossy().into_owned(), client.clone());
    }

    for agent in &params.agents {
        state::register_agent(AgentInfo::new(
            agent.name.clone(),
            agent.role,
            agent.swarm.clone(),
            agent.task.clone(),
        ))
        .await;
    }

    // Install the unified dispatch handler on every subscribe-channel client
    // the queen holds, not just `general` — `inbox-queen` carries directly
    // addressed reports (blocker/done) that never touch the general fan-out.
    for name in [layout::GENERAL_CHANNEL, layout::QUEEN_INBOX] {
        let Some(client) = queen_clients.get(name).cloned() else {
            continue;
        };
        let mut rx = client.subscribe();
        let activity_for_handlers = activity.clone();
        let parent_for_handlers = parent_queen_inbox.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let ClientEvent::Message(message) = event
                    && let Some(from) = message
                        .data
                        .as_ref()
                        .and_then(|d| d.get("from"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                {
                    crate::swarm::dispatch::dispatch_message(
                        &from,
                        &message,
                        &activity_for_handlers,
                        None,
                        parent_for_handlers.as_ref(),
                    )
                    .await;
                }
            }
        });
    }

    let callbacks = StateCallbacks::default();
    let generation = state::set_swarm_state(inner, callbacks);

    let agent_names: Vec<String> = params.agents.iter().map(|a| a.name.clone()).collect();

    for agent in &params.agents {
        let topic = agent.swarm.as_deref().and_then(|s| topics.get(s)).map(String::as_str);
        match spawn::spawn_agent(binary, agent, &group_path, None, cwd, known, topic).await {
            Ok(mut spawned) => {
                state::record_spawned_pid(&agent.name, &spawned).await;
                let name = agent.name.clone();
                let activity = activity.clone();
                let tmp_dir = spawned.tmp_dir.clone();
                tokio::spawn(async move {
                    stream_child_stdio(&mut spawned.child, &name, &activity).await;
                    let exit = spawned.child.wait().await.ok();
                    let gen_now = state::current_generation();
                    if gen_now == generation {
                        let code = exit.as_ref().and_then(|s| s.code());
                        let terminal = match state::current_state() {
                            Some(s) => s
                                .agents
                                .lock()
                                .await
                                .get(&name)
                                .map(|a| a.status.is_terminal())
                                .unwrap_or(true),
                            None => true,
                        };
                        if !terminal {
                            let next = if code == Some(0) {
                                AgentStatus::Done
                            } else {
                                AgentStatus::Crashed
                            };
                            state::update_agent_status(&name, next, StatusFields::default()).await;
                        }
                    }
                    spawn::cleanup_spawn_tmp(&tmp_dir).await;
                });
            }
            Err(_) => {
                state::update_agent_status(&agent.name, AgentStatus::Crashed, StatusFields::default())
                    .await;
            }
        }
    }

    let timeout_generation = generation;
    let timeout_names = agent_names.clone();
    tokio::spawn(async move {
        tokio::time::sleep(STARTING_TIMEOUT).await;
        if state::current_generation() != timeout_generation {
            return;
        }
        for name in &timeout_names {
            if let Some(state) = state::current_state() {
                let is_starting = state
                    .agents
                    .lock()
                    .await
                    .get(name)
                    .map(|a| a.status == AgentStatus::Starting)
                    .unwrap_or(false);
                if is_starting {
                    state::update_agent_status(name, AgentStatus::Crashed, StatusFields::default())
                        .await;
                }
            }
        }
    });

    Ok(AsyncLaunch {
        swarm_id,
        group_path,
        agent_names,
    })
}

async fn parent_queen_inbox_client() -> Option<SharedClient> {
    let group_path = crate::identity::channel_group_path()?;
    let socket = group_path.join(format!("{}.sock", layout::QUEEN_INBOX));
    let client = Arc::new(ChannelClient::new(socket));
    client.connect().await.ok()?;
    Some(client)
}

/// Read a spawned agent's stdout line-by-line into `activity`, and capture
/// stderr (bounded) for post-mortem reporting.
async fn stream_child_stdio(child: &mut Child, agent: &str, activity: &ActivityStore) -> String {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_fut = async {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                activity.feed_raw_event(agent, &line).await;
            }
        }
    };

    let stderr_fut = async {
        let mut collected = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                if collected.len() > 64 * 1024 {
                    break;
                }
            }
        }
        collected
    };

    let (_, stderr_text) = tokio::join!(stdout_fut, stderr_fut);
    stderr_text
}

async fn run_blocking(
    binary: &Path,
    cwd: &Path,
    activity: Arc<ActivityStore>,
    params: SwarmToolParams,
) -> Result<BlockingOutcome, SwarmError> {
    let discovered = discover_agents(cwd, DiscoveryScope::Both).await.ok();
    let known = discovered.as_ref().map(|d| &d.agents);
    let concurrency = params.concurrency.unwrap_or(1).max(1);

    if !params.chain.is_empty() {
        let mut previous_text: Option<String> = None;
        let mut results = Vec::with_capacity(params.chain.len());
        for (idx, step_def) in params.chain.iter().enumerate() {
            let mut def = step_def.clone();
            if let Some(previous) = &previous_text {
                def.task = def.task.replace("{previous}", previous);
            }
            let result = run_one_agent(binary, &def, cwd, known, activity.clone(), Some(idx + 1)).await;
            previous_text = last_assistant_text(&result.messages);
            results.push(result);
        }
        return Ok(BlockingOutcome::Chain(results));
    }

    if params.agents.len() == 1 {
        let result = run_one_agent(binary, &params.agents[0], cwd, known, activity, None).await;
        return Ok(BlockingOutcome::Single(result));
    }

    let results = map_with_concurrency_limit(params.agents.clone(), concurrency, |def| {
        let binary = binary.to_path_buf();
        let cwd = cwd.to_path_buf();
        let known = known.cloned();
        let activity = activity.clone();
        async move {
            run_one_agent(&binary, &def, &cwd, known.as_ref(), activity, None).await
        }
    })
    .await;

    Ok(BlockingOutcome::Parallel(results))
}

async fn run_one_agent(
    binary: &Path,
    def: &AgentDef,
    cwd: &Path,
    known: Option<&std::collections::HashMap<String, crate::swarm::discovery::AgentConfig>>,
    activity: Arc<ActivityStore>,
    step: Option<usize>,
) -> SingleResult {
    let spawned = match spawn::spawn_agent(binary, def, cwd, None, cwd, known, None).await {
        Ok(s) => s,
        Err(e) => {
            return SingleResult {
                agent: def.name.clone(),
                agent_source: None,
                task: def.task.clone(),
                exit_code: None,
                messages: Vec::new(),
                stderr: String::new(),
                usage: Usage::default(),
                model: def.model.clone(),
                error_message: Some(e.to_string()),
                step,
            };
        }
    };

    let mut child = spawned.child;
    let stderr = stream_child_stdio(&mut child, &def.name, &activity).await;
    let status = child.wait().await.ok();
    spawn::cleanup_spawn_tmp(&spawned.tmp_dir).await;

    let events = activity.events_for(&def.name).await;
    let messages: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ActivityEvent::Message { message_text, .. } => Some(message_text.clone()),
            _ => None,
        })
        .collect();
    let usage = activity.usage_for(&def.name).await;
    let exit_code = status.and_then(|s| s.code());
    let error_message = match exit_code {
        Some(0) | None => None,
        Some(code) => Some(format!("exited with code {code}")),
    };

    SingleResult {
        agent: def.name.clone(),
        agent_source: spawned.source,
        task: def.task.clone(),
        exit_code,
        messages,
        stderr,
        usage,
        model: spawned.model,
        error_message,
        step,
    }
}

fn last_assistant_text(messages: &[String]) -> Option<String> {
    messages.last().cloned()
}

/// Launch `min(limit, items.len())` workers that atomically claim the next
/// index; results preserve input order. A single worker's future panicking
/// is not suppressed — this mirrors the spec's "a single worker failure
/// propagates" without forcibly cancelling peers.
async fn map_with_concurrency_limit<T, F, Fut, R>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send,
    R: Send + 'static,
{
    let items = Arc::new(items);
    let next_index = Arc::new(AtomicUsize::new(0));
    let results: Arc<tokio::sync::Mutex<Vec<Option<R>>>> =
        Arc::new(tokio::sync::Mutex::new((0..items.len()).map(|_| None).collect()));
    let f = Arc::new(f);

    let workers = limit.min(items.len().max(1));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let items = items.clone();
        let next_index = next_index.clone();
        let results = results.clone();
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let idx = next_index.fetch_add(1, Ordering::SeqCst);
                if idx >= items.len() {
                    break;
                }
                let item = items[idx].clone();
                let result = f(item).await;
                results.lock().await[idx] = Some(result);
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    Arc::try_unwrap(results)
        .map(|m| m.into_inner())
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.expect("every index claimed exactly once"))
        .collect()
}

/// Format a [`BlockingOutcome`] for the host, per spec §4.12's per-mode
/// formatting rules.
pub fn format_blocking_outcome(outcome: &BlockingOutcome) -> String {
    match outcome {
        BlockingOutcome::Single(result) => format_single(result),
        BlockingOutcome::Parallel(results) => {
            let succeeded = results.iter().filter(|r| r.error_message.is_none()).count();
            let mut out = format!("Parallel execution: {succeeded}/{} succeeded\n", results.len());
            for result in results {
                out.push_str(&format_outcome_line(result));
                out.push('\n');
            }
            out
        }
        BlockingOutcome::Chain(results) => {
            let succeeded = results.iter().filter(|r| r.error_message.is_none()).count();
            let mut out = format!("Chain completed: {succeeded}/{} steps succeeded\n", results.len());
            for result in results {
                out.push_str(&format_outcome_line(result));
                out.push('\n');
            }
            out
        }
    }
}

fn format_single(result: &SingleResult) -> String {
    match &result.error_message {
        Some(err) => format!("{err}\n{}", preview(&result.stderr, 400)),
        None => result
            .messages
            .last()
            .cloned()
            .unwrap_or_else(|| "(no output)".to_string()),
    }
}

fn format_outcome_line(result: &SingleResult) -> String {
    match &result.error_message {
        Some(err) => format!("✗ {}: {err}", result.agent),
        None => format!(
            "✓ {}: {}",
            result.agent,
            preview(&result.messages.last().cloned().unwrap_or_default(), 200)
        ),
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
