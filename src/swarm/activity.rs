//! Activity and usage aggregation (spec §4.13, first half): parses a child
//! agent's stdout as newline-delimited JSON events and accumulates per-agent
//! token/cost usage.
//!
//! Grounded in `acp/worker.rs`'s line-by-line stdout dispatch on a tagged
//! `serde_json::Value` and `lib.rs`'s `ProcessEvent` tagged union for the
//! synthetic/host-notification side.

use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

const THINKING_CAP: usize = 4096;
const MESSAGE_CAP: usize = 4096;
const TOOL_RESULT_CAP: usize = 8192;
const SUMMARY_PREVIEW_CAP: usize = 60;
const GENERIC_ARGS_CAP: usize = 50;

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    ToolStart {
        tool_name: String,
        tool_args: Option<serde_json::Value>,
        summary: String,
    },
    ToolEnd {
        tool_name: String,
        is_error: bool,
        tool_result: Option<String>,
        summary: String,
    },
    Thinking {
        summary: String,
        tokens: Option<u64>,
    },
    Message {
        message_text: String,
        tokens: Option<u64>,
        summary: String,
    },
    /// Injected by channel-message dispatch rather than parsed from stdout.
    Synthetic { kind: String, summary: String },
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost_total: f64,
    pub context_tokens: u64,
    pub turns: u64,
}

impl Usage {
    fn accumulate(&mut self, delta: &UsageDelta) {
        self.input += delta.input.unwrap_or(0);
        self.output += delta.output.unwrap_or(0);
        self.cache_read += delta.cache_read.unwrap_or(0);
        self.cache_write += delta.cache_write.unwrap_or(0);
        self.cost_total += delta.cost_total.unwrap_or(0.0);
        if let Some(total) = delta.total_tokens {
            self.context_tokens = total;
        }
        self.turns += 1;
    }
}

#[derive(Default)]
struct UsageDelta {
    input: Option<u64>,
    output: Option<u64>,
    cache_read: Option<u64>,
    cache_write: Option<u64>,
    cost_total: Option<f64>,
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RawEvent {
    #[serde(rename = "tool_execution_start")]
    ToolStart {
        #[serde(rename = "toolName")]
        tool_name: String,
        args: Option<serde_json::Value>,
    },
    #[serde(rename = "tool_execution_end")]
    ToolEnd {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "isError")]
        is_error: bool,
        result: Option<serde_json::Value>,
    },
    #[serde(rename = "message_end")]
    MessageEnd { message: RawMessage },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContentPart>,
    usage: Option<RawUsage>,
    #[serde(default)]
    #[allow(dead_code)]
    model: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RawContentPart {
    #[serde(rename = "thinking")]
    Thinking { text: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawUsage {
    input: Option<u64>,
    output: Option<u64>,
    #[serde(rename = "cacheRead")]
    cache_read: Option<u64>,
    #[serde(rename = "cacheWrite")]
    cache_write: Option<u64>,
    cost: Option<RawCost>,
    #[serde(rename = "totalTokens")]
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct RawCost {
    total: Option<f64>,
}

#[derive(Default)]
struct AgentActivity {
    events: Vec<ActivityEvent>,
    usage: Usage,
}

/// Append-only per-agent activity log plus usage accumulator. No ring-buffer
/// cap — grows unbounded by design; consumers slice the tail themselves.
#[derive(Default)]
pub struct ActivityStore {
    agents: Mutex<HashMap<String, AgentActivity>>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one stdout line from `agent` as JSON and push derived events.
    /// Blank lines and parse failures are ignored silently.
    pub async fn feed_raw_event(&self, agent: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Ok(raw) = serde_json::from_str::<RawEvent>(line) else {
            return;
        };

        let mut agents = self.agents.lock().await;
        let entry = agents.entry(agent.to_string()).or_default();

        match raw {
            RawEvent::ToolStart { tool_name, args } => {
                let summary = format_tool_summary(&tool_name, args.as_ref());
                entry.events.push(ActivityEvent::ToolStart {
                    tool_name,
                    tool_args: args,
                    summary,
                });
            }
            RawEvent::ToolEnd {
                tool_name,
                is_error,
                result,
            } => {
                let result_text = result.map(|r| truncate(&render_value(&r), TOOL_RESULT_CAP));
                let summary = format_tool_summary(&tool_name, None);
                entry.events.push(ActivityEvent::ToolEnd {
                    tool_name,
                    is_error,
                    tool_result: result_text,
                    summary,
                });
            }
            RawEvent::MessageEnd { message } => {
                for part in &message.content {
                    match part {
                        RawContentPart::Thinking { text } => {
                            let capped = truncate(text, THINKING_CAP);
                            entry.events.push(ActivityEvent::Thinking {
                                summary: capped,
                                tokens: None,
                            });
                        }
                        RawContentPart::Text { text } => {
                            let capped = truncate(text, MESSAGE_CAP);
                            let preview = truncate(text, SUMMARY_PREVIEW_CAP);
                            entry.events.push(ActivityEvent::Message {
                                message_text: capped,
                                tokens: None,
                                summary: preview,
                            });
                        }
                        RawContentPart::Other => {}
                    }
                }
                if let Some(usage) = &message.usage {
                    let delta = UsageDelta {
                        input: usage.input,
                        output: usage.output,
                        cache_read: usage.cache_read,
                        cache_write: usage.cache_write,
                        cost_total: usage.cost.as_ref().and_then(|c| c.total),
                        total_tokens: usage.total_tokens,
                    };
                    entry.usage.accumulate(&delta);
                }
            }
        }
    }

    /// Inject a human-readable entry alongside the parsed JSON-event stream.
    pub async fn push_synthetic_event(&self, agent: &str, kind: impl Into<String>, summary: impl Into<String>) {
        let mut agents = self.agents.lock().await;
        agents
            .entry(agent.to_string())
            .or_default()
            .events
            .push(ActivityEvent::Synthetic {
                kind: kind.into(),
                summary: summary.into(),
            });
    }

    pub async fn events_for(&self, agent: &str) -> Vec<ActivityEvent> {
        self.agents
            .lock()
            .await
            .get(agent)
            .map(|a| a.events.clone())
            .unwrap_or_default()
    }

    pub async fn usage_for(&self, agent: &str) -> Usage {
        self.agents
            .lock()
            .await
            .get(agent)
            .map(|a| a.usage.clone())
            .unwrap_or_default()
    }

    /// Sum of per-agent usage, excluding `context_tokens` (which is only
    /// meaningful per-agent).
    pub async fn aggregate_usage(&self) -> Usage {
        let agents = self.agents.lock().await;
        let mut total = Usage::default();
        for agent in agents.values() {
            total.input += agent.usage.input;
            total.output += agent.usage.output;
            total.cache_read += agent.usage.cache_read;
            total.cache_write += agent.usage.cache_write;
            total.cost_total += agent.usage.cost_total;
            total.turns += agent.usage.turns;
        }
        total
    }

    /// Clear one agent's activity, or every agent's if `agent` is `None`.
    pub async fn clear_activity(&self, agent: Option<&str>) {
        let mut agents = self.agents.lock().await;
        match agent {
            Some(name) => {
                agents.remove(name);
            }
            None => agents.clear(),
        }
    }
}

fn render_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Tool-specific one-line summary (spec §4.13 "Summary formatting").
pub fn format_tool_summary(tool_name: &str, args: Option<&serde_json::Value>) -> String {
    match tool_name {
        "bash" => {
            let command = args
                .and_then(|a| a.get("command"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            truncate(&format!("bash {command}"), SUMMARY_PREVIEW_CAP)
        }
        "read" | "write" | "edit" | "ls" | "grep" | "find" => {
            let path = args
                .and_then(|a| a.get("path").or_else(|| a.get("file_path")))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let shortened = shorten_path(path);
            let mut summary = format!("{tool_name} {shortened}");
            if let Some(offset) = args.and_then(|a| a.get("offset")).and_then(|v| v.as_u64()) {
                let end = args.and_then(|a| a.get("limit")).and_then(|v| v.as_u64());
                match end {
                    Some(end) => summary.push_str(&format!(":{offset}-{}", offset + end)),
                    None => summary.push_str(&format!(":{offset}")),
                }
            }
            if let Some(pattern) = args.and_then(|a| a.get("pattern")).and_then(|v| v.as_str()) {
                summary.push_str(&format!(" /{pattern}/"));
            }
            summary
        }
        other => {
            let args_json = args.map(render_value).unwrap_or_default();
            format!("{other} {}", truncate(&args_json, GENERIC_ARGS_CAP))
        }
    }
}

fn shorten_path(path: &str) -> String {
    let home = dirs::home_dir().map(|h| h.to_string_lossy().into_owned());
    let replaced = match &home {
        Some(home) if path.starts_with(home.as_str()) => {
            format!("~{}", &path[home.len()..])
        }
        _ => path.to_string(),
    };
    let segments: Vec<&str> = replaced.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > 2 {
        format!(".../{}", segments[segments.len() - 2..].join("/"))
    } else {
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tool_start_and_end_produce_summaries() {
        let store = ActivityStore::new();
        store
            .feed_raw_event(
                "a1",
                r#"{"type":"tool_execution_start","toolName":"bash","args":{"command":"ls -la"}}"#,
            )
            .await;
        store
            .feed_raw_event(
                "a1",
                r#"{"type":"tool_execution_end","toolName":"bash","isError":false,"result":"done"}"#,
            )
            .await;

        let events = store.events_for("a1").await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            ActivityEvent::ToolStart { summary, .. } => assert_eq!(summary, "bash ls -la"),
            _ => panic!("expected ToolStart"),
        }
    }

    #[tokio::test]
    async fn message_end_accumulates_usage_and_splits_content() {
        let store = ActivityStore::new();
        let line = r#"{"type":"message_end","message":{"role":"assistant","content":[{"type":"thinking","text":"pondering"},{"type":"text","text":"hello there"}],"usage":{"input":10,"output":20,"cacheRead":5,"cacheWrite":0,"cost":{"total":0.002},"totalTokens":35}}}"#;
        store.feed_raw_event("a1", line).await;

        let events = store.events_for("a1").await;
        assert_eq!(events.len(), 2);
        let usage = store.usage_for("a1").await;
        assert_eq!(usage.input, 10);
        assert_eq!(usage.output, 20);
        assert_eq!(usage.cache_read, 5);
        assert_eq!(usage.context_tokens, 35);
        assert_eq!(usage.turns, 1);
    }

    #[tokio::test]
    async fn blank_and_unparseable_lines_are_ignored() {
        let store = ActivityStore::new();
        store.feed_raw_event("a1", "").await;
        store.feed_raw_event("a1", "   ").await;
        store.feed_raw_event("a1", "not json").await;
        assert!(store.events_for("a1").await.is_empty());
    }

    #[tokio::test]
    async fn aggregate_usage_sums_across_agents_excluding_context_tokens() {
        let store = ActivityStore::new();
        let line = |input: u64| {
            format!(
                r#"{{"type":"message_end","message":{{"role":"assistant","content":[],"usage":{{"input":{input},"output":0,"totalTokens":999}}}}}}"#
            )
        };
        store.feed_raw_event("a1", &line(10)).await;
        store.feed_raw_event("a2", &line(20)).await;

        let total = store.aggregate_usage().await;
        assert_eq!(total.input, 30);
        assert_eq!(total.context_tokens, 0);
    }

    #[tokio::test]
    async fn clear_activity_clears_one_or_all() {
        let store = ActivityStore::new();
        store.push_synthetic_event("a1", "message", "hi").await;
        store.push_synthetic_event("a2", "message", "hi").await;

        store.clear_activity(Some("a1")).await;
        assert!(store.events_for("a1").await.is_empty());
        assert_eq!(store.events_for("a2").await.len(), 1);

        store.clear_activity(None).await;
        assert!(store.events_for("a2").await.is_empty());
    }

    #[test]
    fn generic_tool_summary_includes_truncated_args() {
        let args = serde_json::json!({"query": "select * from a very long table name that exceeds fifty characters for sure"});
        let summary = format_tool_summary("custom_tool", Some(&args));
        assert!(summary.starts_with("custom_tool "));
    }
}
