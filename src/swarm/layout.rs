//! Swarm channel layout (spec §4.7): the convention of reserved channel
//! names a swarm's [`crate::channel::group::ChannelGroup`] is built from.

use crate::channel::group::{ChannelDef, ChannelGroup};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Broadcast channel every agent and the queen subscribe to by default.
pub const GENERAL_CHANNEL: &str = "general";

/// The queen's receive-only inbox, by convention.
pub const QUEEN_INBOX: &str = "inbox-queen";

fn invalid_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static pattern is valid"))
}

/// Replace any run of characters outside `[A-Za-z0-9._-]` with a single `-`.
pub fn sanitize(name: &str) -> String {
    invalid_run().replace_all(name, "-").into_owned()
}

/// `inbox-<sanitized agent name>`.
pub fn inbox_name(agent: &str) -> String {
    format!("inbox-{}", sanitize(agent))
}

/// `topic-<sanitized swarm name>`.
pub fn topic_name(swarm: &str) -> String {
    format!("topic-{}", sanitize(swarm))
}

/// A channel group's socket directory, under the configured swarm base dir.
pub fn group_path(base_dir: &std::path::Path, swarm_id: &str) -> PathBuf {
    base_dir.join(swarm_id)
}

/// Minimal view of a spawned agent needed to derive channel layout — decoupled
/// from [`crate::swarm::spawn::AgentDef`] so layout stays a pure function of
/// name/swarm.
#[derive(Debug, Clone)]
pub struct AgentChannelSpec {
    pub name: String,
    pub swarm: Option<String>,
}

/// Build the channel group and swarm→topic-channel map for a swarm.
///
/// Channels are `general`, `inbox-queen`, and `inbox-<agent>` for every
/// agent, plus one `topic-<swarm>` per distinct `swarm` value when the
/// agents span two or more swarms.
pub fn create_swarm_channel_group(
    base_dir: &std::path::Path,
    swarm_id: &str,
    agents: &[AgentChannelSpec],
) -> (ChannelGroup, HashMap<String, String>) {
    let mut defs = vec![
        ChannelDef::new(GENERAL_CHANNEL),
        ChannelDef::new(QUEEN_INBOX),
    ];
    for agent in agents {
        defs.push(ChannelDef::new(inbox_name(&agent.name)));
    }

    let mut distinct_swarms: Vec<&str> = agents
        .iter()
        .filter_map(|a| a.swarm.as_deref())
        .collect();
    distinct_swarms.sort_unstable();
    distinct_swarms.dedup();

    let mut topics = HashMap::new();
    if distinct_swarms.len() >= 2 {
        for swarm in distinct_swarms {
            let topic = topic_name(swarm);
            defs.push(ChannelDef::new(topic.clone()));
            topics.insert(swarm.to_string(), topic);
        }
    }

    let group = ChannelGroup::new(group_path(base_dir, swarm_id), defs);
    (group, topics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, swarm: Option<&str>) -> AgentChannelSpec {
        AgentChannelSpec {
            name: name.to_string(),
            swarm: swarm.map(str::to_string),
        }
    }

    #[test]
    fn sanitize_collapses_special_char_runs() {
        assert_eq!(sanitize("scout one!!"), "scout-one-");
        assert_eq!(sanitize("a_b.c-d"), "a_b.c-d");
    }

    #[test]
    fn single_swarm_yields_no_topic_channels() {
        let agents = vec![spec("a1", Some("test")), spec("a2", Some("test"))];
        let (group, topics) = create_swarm_channel_group(std::path::Path::new("/tmp"), "s1", &agents);
        assert!(topics.is_empty());
        let defs_names: Vec<&str> = group.defined_channel_names();
        assert!(defs_names.contains(&"general"));
        assert!(defs_names.contains(&"inbox-queen"));
        assert!(defs_names.contains(&"inbox-a1"));
        assert!(defs_names.contains(&"inbox-a2"));
    }

    #[test]
    fn multiple_swarms_yield_one_topic_channel_each() {
        let agents = vec![spec("a1", Some("alpha")), spec("a2", Some("beta"))];
        let (group, topics) = create_swarm_channel_group(std::path::Path::new("/tmp"), "s2", &agents);
        assert_eq!(topics.len(), 2);
        assert_eq!(topics.get("alpha").unwrap(), "topic-alpha");
        let defs_names: Vec<&str> = group.defined_channel_names();
        assert!(defs_names.contains(&"topic-alpha"));
        assert!(defs_names.contains(&"topic-beta"));
    }
}
