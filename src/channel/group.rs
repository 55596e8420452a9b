//! Channel group: a directory of named channels started/stopped together,
//! with a manifest written only once every channel is listening (spec §4.4).

use crate::channel::server::ChannelServer;
use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Definition of one channel within a group.
#[derive(Debug, Clone)]
pub struct ChannelDef {
    pub name: String,
    pub echo_to_sender: bool,
}

impl ChannelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            echo_to_sender: false,
        }
    }
}

/// On-disk manifest written to `group.json` once every channel is
/// listening.
#[derive(Debug, Serialize, Deserialize)]
pub struct GroupManifest {
    pub created: String,
    pub pid: u32,
    pub channels: Vec<ManifestChannel>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestChannel {
    pub name: String,
}

/// A directory of channels managed as a unit: started in parallel with
/// rollback on partial failure, and whose manifest file is the
/// happens-after marker that every listed socket is bindable.
pub struct ChannelGroup {
    group_path: PathBuf,
    defs: Vec<ChannelDef>,
    max_frame_bytes: u32,
    channels: Mutex<HashMap<String, ChannelServer>>,
    started: AtomicBool,
}

impl ChannelGroup {
    pub fn new(group_path: impl Into<PathBuf>, defs: Vec<ChannelDef>) -> Self {
        Self {
            group_path: group_path.into(),
            defs,
            max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
            channels: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Override the frame size cap applied to every channel this group
    /// starts, e.g. from a loaded [`crate::config::ChannelsConfig`]. Must be
    /// called before [`Self::start`].
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn group_path(&self) -> &Path {
        &self.group_path
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn socket_path_for(&self, name: &str) -> PathBuf {
        self.group_path.join(format!("{name}.sock"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.group_path.join("group.json")
    }

    /// Start every configured channel in parallel. If any fail, every
    /// channel that did start is stopped before returning the first error —
    /// `group.json` is written only after every channel succeeds.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyStarted);
        }

        tokio::fs::create_dir_all(&self.group_path).await?;

        let mut started_servers: Vec<(String, ChannelServer)> = Vec::new();
        let mut first_error: Option<ChannelError> = None;

        let futures = self.defs.iter().map(|def| {
            let server = ChannelServer::new(self.socket_path_for(&def.name), def.echo_to_sender)
                .with_max_frame_bytes(self.max_frame_bytes);
            async move {
                let result = server.start().await;
                (def.name.clone(), server, result)
            }
        });
        let results = futures::future::join_all(futures).await;

        for (name, server, result) in results {
            match result {
                Ok(()) => started_servers.push((name, server)),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            for (_, server) in started_servers {
                server.stop().await;
            }
            self.started.store(false, Ordering::SeqCst);
            return Err(error);
        }

        let mut map = self.channels.lock().await;
        for (name, server) in started_servers {
            map.insert(name, server);
        }
        drop(map);

        self.write_manifest().await?;
        Ok(())
    }

    async fn write_manifest(&self) -> Result<(), ChannelError> {
        let mut names: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        names.sort();
        let channels = names.into_iter().map(|name| ManifestChannel { name }).collect();
        let manifest = GroupManifest {
            created: now_iso8601(),
            pid: std::process::id(),
            channels,
        };
        let json = serde_json::to_vec_pretty(&manifest).expect("manifest always serializes");
        tokio::fs::write(self.manifest_path(), json).await?;
        Ok(())
    }

    /// Idempotent stop: disconnects and closes every channel, unlinks
    /// `group.json`, and optionally removes the group directory.
    pub async fn stop(&self, remove_dir: bool) {
        self.started.store(false, Ordering::SeqCst);

        let servers: Vec<ChannelServer> = {
            let mut map = self.channels.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for server in servers {
            server.stop().await;
        }

        let _ = tokio::fs::remove_file(self.manifest_path()).await;
        if remove_dir {
            let _ = tokio::fs::remove_dir_all(&self.group_path).await;
        }
    }

    /// Start one additional channel at runtime and append it to the
    /// manifest.
    pub async fn add_channel(&self, def: ChannelDef) -> Result<(), ChannelError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ChannelError::GroupNotStarted);
        }

        let mut map = self.channels.lock().await;
        if map.contains_key(&def.name) {
            return Err(ChannelError::DuplicateChannel(def.name));
        }

        let server = ChannelServer::new(self.socket_path_for(&def.name), def.echo_to_sender)
            .with_max_frame_bytes(self.max_frame_bytes);
        server.start().await?;
        map.insert(def.name.clone(), server);
        drop(map);

        self.write_manifest().await
    }

    /// Stop and remove a channel at runtime, rewriting the manifest.
    pub async fn remove_channel(&self, name: &str) -> Result<(), ChannelError> {
        let server = {
            let mut map = self.channels.lock().await;
            map.remove(name)
        };
        let Some(server) = server else {
            return Err(ChannelError::ChannelNotFound(name.to_string()));
        };
        server.stop().await;
        self.write_manifest().await
    }

    /// Socket path a channel named `name` would bind to within this group,
    /// whether or not it has been started yet.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_path_for(name)
    }

    /// Names of the channels currently running in this group.
    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    /// Names of the channels this group was configured with, regardless of
    /// whether it has been started. Useful for layout assertions before a
    /// group is ever bound.
    pub fn defined_channel_names(&self) -> Vec<&str> {
        self.defs.iter().map(|d| d.name.as_str()).collect()
    }
}

fn now_iso8601() -> String {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    chrono::DateTime::<chrono::Utc>::from_timestamp(duration.as_secs() as i64, duration.subsec_nanos())
        .unwrap_or_default()
        .to_rfc3339()
}
