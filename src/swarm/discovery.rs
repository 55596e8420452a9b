//! Agent discovery (spec §4.9): scans `~/.pi/agent/agents/` and the nearest
//! ancestor `.pi/agents/` for markdown files with YAML-ish frontmatter.

use crate::error::DiscoveryError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Which directories to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryScope {
    User,
    Project,
    Both,
}

/// A discovered (or inline) agent definition: frontmatter plus body-as-prompt.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
    pub source: Source,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    User,
    Project,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::User => write!(f, "user"),
            Source::Project => write!(f, "project"),
        }
    }
}

/// Result of a discovery scan.
pub struct Discovered {
    pub agents: HashMap<String, AgentConfig>,
    pub project_agents_dir: Option<PathBuf>,
}

/// Parse YAML-ish frontmatter: if the first non-empty line is `---`, collect
/// `key: value` lines until a closing `---`; everything after is the body.
/// If there is no valid closing delimiter, returns empty frontmatter and the
/// whole input as body.
pub fn parse_frontmatter(text: &str) -> (HashMap<String, String>, String) {
    let mut lines = text.lines();

    // Find the first non-empty line.
    let mut consumed = 0usize;
    let opening = loop {
        match lines.next() {
            Some(line) => {
                consumed += 1;
                if !line.trim().is_empty() {
                    break Some(line);
                }
            }
            None => break None,
        }
    };

    if opening != Some("---") {
        return (HashMap::new(), text.to_string());
    }

    let mut frontmatter = HashMap::new();
    let all_lines: Vec<&str> = text.lines().collect();
    let mut idx = consumed; // index just after the opening `---`
    let mut found_close = false;

    while idx < all_lines.len() {
        let line = all_lines[idx];
        if line.trim() == "---" {
            found_close = true;
            idx += 1;
            break;
        }
        if let Some(colon) = line.find(':') {
            let key = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if !key.is_empty() && !value.is_empty() {
                frontmatter.insert(key.to_string(), value.to_string());
            }
        }
        idx += 1;
    }

    if !found_close {
        return (HashMap::new(), text.to_string());
    }

    let body = all_lines[idx..].join("\n");
    (frontmatter, body)
}

/// Walk upward from `start`, at most 10 levels, for the first ancestor
/// containing `.pi/agents/`.
pub fn find_nearest_project_agents_dir(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    for _ in 0..10 {
        let candidate = dir.join(".pi").join("agents");
        if candidate.is_dir() {
            return Some(candidate);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

fn user_agents_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pi").join("agent").join("agents"))
}

async fn load_dir(dir: &Path, source: Source) -> Result<Vec<AgentConfig>, DiscoveryError> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let text = tokio::fs::read_to_string(&path).await?;
        let (frontmatter, body) = parse_frontmatter(&text);

        let Some(name) = frontmatter.get("name").filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(description) = frontmatter.get("description").filter(|s| !s.is_empty()) else {
            continue;
        };

        let tools = frontmatter.get("tools").map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        out.push(AgentConfig {
            name: name.clone(),
            description: description.clone(),
            system_prompt: body,
            model: frontmatter.get("model").cloned(),
            tools,
            source,
            file_path: path,
        });
    }

    Ok(out)
}

/// Discover agent configs under `cwd`'s project tree and/or the user agents
/// directory, per `scope`. When both scopes are read, project entries
/// override same-named user entries.
pub async fn discover_agents(
    cwd: &Path,
    scope: DiscoveryScope,
) -> Result<Discovered, DiscoveryError> {
    let mut agents: HashMap<String, AgentConfig> = HashMap::new();

    if matches!(scope, DiscoveryScope::User | DiscoveryScope::Both)
        && let Some(user_dir) = user_agents_dir()
    {
        for agent in load_dir(&user_dir, Source::User).await? {
            agents.insert(agent.name.clone(), agent);
        }
    }

    let project_agents_dir = find_nearest_project_agents_dir(cwd);
    if matches!(scope, DiscoveryScope::Project | DiscoveryScope::Both)
        && let Some(project_dir) = &project_agents_dir
    {
        for agent in load_dir(project_dir, Source::Project).await? {
            agents.insert(agent.name.clone(), agent);
        }
    }

    Ok(Discovered {
        agents,
        project_agents_dir,
    })
}
