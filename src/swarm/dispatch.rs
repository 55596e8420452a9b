//! Notification dispatch (spec §4.13, second half): routes incoming channel
//! messages by `data.type` to state updates, synthetic activity, host
//! notifications, and upward relay to a parent's queen-inbox.
//!
//! Grounded in the same `lib.rs` `ProcessEvent`-dispatch idiom as
//! [`crate::swarm::activity`], generalized from a process-event tagged union
//! to the swarm `data.type` convention in spec §6.

use crate::framing::Message;
use crate::swarm::activity::ActivityStore;
use crate::swarm::state::{self, AgentStatus, StatusFields};
use std::sync::Arc;

/// A host notification surfaced by dispatch. The embedding host renders or
/// routes these; this crate only produces them.
#[derive(Debug, Clone)]
pub struct HostNotification {
    pub agent: String,
    pub text: String,
    /// True for notifications that should interrupt the host (e.g. a
    /// blocker), false for routine status updates.
    pub interrupt: bool,
}

/// Callback the embedding host supplies to receive [`HostNotification`]s.
pub type NotifyFn = Arc<dyn Fn(HostNotification) + Send + Sync>;

/// Dispatch one incoming [`Message`] from `agent` against shared activity and
/// swarm state, optionally relaying it upward to the parent's queen-inbox.
pub async fn dispatch_message(
    agent: &str,
    message: &Message,
    activity: &ActivityStore,
    notify: Option<&NotifyFn>,
    parent_queen_inbox: Option<&crate::channel::client::SharedClient>,
) {
    let Some(data_type) = message.data_type() else {
        return;
    };
    let data = message.data.as_ref();
    let get_str = |key: &str| data.and_then(|d| d.get(key)).and_then(|v| v.as_str());

    match data_type {
        "register" => {
            let role = get_str("role").unwrap_or("agent");
            let swarm = get_str("swarm").unwrap_or("");
            activity
                .push_synthetic_event(agent, "message", format!("registered ({role}, {swarm})"))
                .await;
            state::update_agent_status(agent, AgentStatus::Running, StatusFields::default()).await;
        }
        "done" => {
            let summary = get_str("summary").unwrap_or("").to_string();
            state::update_agent_status(
                agent,
                AgentStatus::Done,
                StatusFields {
                    done_summary: Some(summary.clone()),
                    ..Default::default()
                },
            )
            .await;
            activity
                .push_synthetic_event(agent, "message", format!("done: {summary}"))
                .await;
            notify_host(notify, agent, format!("\u{2713} done: {summary}"), false);
        }
        "blocker" => {
            let description = get_str("description").unwrap_or("").to_string();
            state::update_agent_status(
                agent,
                AgentStatus::Blocked,
                StatusFields {
                    blocker_description: Some(description.clone()),
                    ..Default::default()
                },
            )
            .await;
            activity
                .push_synthetic_event(agent, "message", format!("blocked: {description}"))
                .await;
            notify_host(notify, agent, format!("blocker: {description}"), true);
        }
        "nudge" => {
            let reason = get_str("reason").unwrap_or("").to_string();
            activity
                .push_synthetic_event(agent, "message", format!("hive-mind: {reason}"))
                .await;
            notify_host(notify, agent, format!("nudge: {reason}"), false);
        }
        "progress" => {
            let phase = get_str("phase").map(str::to_string);
            let detail = get_str("detail").map(str::to_string);
            let percent = data
                .and_then(|d| d.get("percent"))
                .and_then(|v| v.as_u64())
                .map(|p| p.min(100) as u8);

            let headline = detail.clone().or_else(|| phase.clone()).unwrap_or_default();
            let summary = match percent {
                Some(p) => format!("{headline} ({p}%)"),
                None => headline,
            };

            state::update_agent_fields(
                agent,
                StatusFields {
                    progress_phase: phase,
                    progress_percent: percent,
                    progress_detail: detail,
                    ..Default::default()
                },
            )
            .await;
            activity.push_synthetic_event(agent, "message", summary).await;
        }
        "disconnected" => {
            state::update_agent_status(agent, AgentStatus::Disconnected, StatusFields::default())
                .await;
            activity
                .push_synthetic_event(agent, "message", "disconnected")
                .await;
        }
        _ => return,
    }

    if let Some(parent) = parent_queen_inbox {
        let _ = parent.send(message).await;
    }
}

fn notify_host(notify: Option<&NotifyFn>, agent: &str, text: String, interrupt: bool) {
    if let Some(notify) = notify {
        notify(HostNotification {
            agent: agent.to_string(),
            text,
            interrupt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::spawn::AgentRole;
    use crate::swarm::state::{self, AgentInfo, StateCallbacks};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    fn msg(data_type: &str, fields: serde_json::Value) -> Message {
        let mut data = serde_json::Map::new();
        data.insert("type".to_string(), json!(data_type));
        if let serde_json::Value::Object(extra) = fields {
            for (k, v) in extra {
                data.insert(k, v);
            }
        }
        Message::with_data("swarm", data)
    }

    async fn with_fresh_swarm(test: impl std::future::Future<Output = ()>) {
        state::reset();
        state::set_swarm_state(
            state::SwarmStateInner::new(None, std::path::PathBuf::from("/tmp/dispatch"), None),
            StateCallbacks::default(),
        );
        state::register_agent(AgentInfo::new("a1", AgentRole::Agent, None, "t")).await;
        test.await;
    }

    #[tokio::test]
    async fn done_transitions_status_and_notifies() {
        with_fresh_swarm(async {
            let notified: StdArc<AtomicU32> = StdArc::new(AtomicU32::new(0));
            let notified_cb = notified.clone();
            let notify: NotifyFn = StdArc::new(move |n: HostNotification| {
                assert!(!n.interrupt);
                assert!(n.text.contains("all good"));
                notified_cb.fetch_add(1, Ordering::SeqCst);
            });
            let activity = ActivityStore::new();

            let message = msg("done", json!({"from": "a1", "summary": "all good"}));
            dispatch_message("a1", &message, &activity, Some(&notify), None).await;

            assert_eq!(notified.load(Ordering::SeqCst), 1);
            let events = activity.events_for("a1").await;
            assert!(!events.is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn blocker_sets_interrupt_flag() {
        with_fresh_swarm(async {
            let notified: StdArc<AtomicU32> = StdArc::new(AtomicU32::new(0));
            let notified_cb = notified.clone();
            let notify: NotifyFn = StdArc::new(move |n: HostNotification| {
                assert!(n.interrupt);
                notified_cb.fetch_add(1, Ordering::SeqCst);
            });
            let activity = ActivityStore::new();

            let message = msg("blocker", json!({"from": "a1", "description": "need creds"}));
            dispatch_message("a1", &message, &activity, Some(&notify), None).await;
            assert_eq!(notified.load(Ordering::SeqCst), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn unrecognized_type_is_ignored() {
        with_fresh_swarm(async {
            let activity = ActivityStore::new();
            let message = msg("mystery", json!({}));
            dispatch_message("a1", &message, &activity, None, None).await;
            assert!(activity.events_for("a1").await.is_empty());
        })
        .await;
    }
}
