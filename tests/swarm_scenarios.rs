//! Multi-process / multi-socket scenario tests over the real channel
//! fabric (real Unix sockets, no mocks), covering the flat-swarm fan-out,
//! blocker-routing, and instruct-targeting conventions that the swarm
//! coordinator builds on top of.

use pi_swarm::channel::{ChannelClient, ChannelDef, ChannelGroup, ClientEvent};
use pi_swarm::swarm::dispatch::dispatch_message;
use pi_swarm::swarm::layout;
use pi_swarm::swarm::spawn::AgentRole;
use pi_swarm::swarm::state::{self, AgentInfo, AgentStatus, StateCallbacks, SwarmStateInner};
use pi_swarm::Message;
use serde_json::json;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::timeout;

async fn next_message(rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>) -> Message {
    loop {
        match timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("event channel closed")
        {
            ClientEvent::Message(message) => return message,
            _ => continue,
        }
    }
}

/// Scenario 1: a flat swarm of three agents sharing the `general` channel.
/// `a1` broadcasts and every other member sees it exactly once; the sender
/// does not see its own message (default `echo_to_sender=false`).
#[tokio::test]
async fn flat_swarm_fanout_excludes_sender() {
    let dir = tempdir().unwrap();
    let group_path = dir.path().join("flat-1");
    let group = ChannelGroup::new(&group_path, vec![ChannelDef::new(layout::GENERAL_CHANNEL)]);
    group.start().await.unwrap();

    let general_sock = group.socket_path(layout::GENERAL_CHANNEL);
    let a1 = ChannelClient::new(&general_sock);
    let a2 = ChannelClient::new(&general_sock);
    let a3 = ChannelClient::new(&general_sock);
    let mut a1_rx = a1.subscribe();
    let mut a2_rx = a2.subscribe();
    let mut a3_rx = a3.subscribe();
    a1.connect().await.unwrap();
    a2.connect().await.unwrap();
    a3.connect().await.unwrap();

    let mut data = serde_json::Map::new();
    data.insert("type".to_string(), json!("message"));
    data.insert("from".to_string(), json!("a1"));
    let message = Message::with_data("hello swarm", data);
    a1.send(&message).await.unwrap();

    let received_a2 = next_message(&mut a2_rx).await;
    let received_a3 = next_message(&mut a3_rx).await;
    assert_eq!(received_a2.msg, "hello swarm");
    assert_eq!(received_a3.msg, "hello swarm");

    let no_echo = timeout(Duration::from_millis(200), a1_rx.recv()).await;
    assert!(no_echo.is_err(), "sender should not receive its own broadcast");

    group.stop(true).await;
}

/// Scenario 2: a blocker notification sent to `inbox-queen` is routed to
/// whoever is listening on that inbox, carrying its description through
/// untouched.
#[tokio::test]
async fn blocker_routes_to_queen_inbox() {
    let dir = tempdir().unwrap();
    let group_path = dir.path().join("blocker-swarm");
    let group = ChannelGroup::new(&group_path, vec![ChannelDef::new(layout::QUEEN_INBOX)]);
    group.start().await.unwrap();

    let inbox_sock = group.socket_path(layout::QUEEN_INBOX);
    let queen = ChannelClient::new(&inbox_sock);
    let a2 = ChannelClient::new(&inbox_sock);
    let mut queen_rx = queen.subscribe();
    queen.connect().await.unwrap();
    a2.connect().await.unwrap();

    let mut data = serde_json::Map::new();
    data.insert("type".to_string(), json!("blocker"));
    data.insert("from".to_string(), json!("a2"));
    data.insert("description".to_string(), json!("need help"));
    let message = Message::with_data("need help", data);
    a2.send(&message).await.unwrap();

    let received = next_message(&mut queen_rx).await;
    assert_eq!(received.data_type(), Some("blocker"));
    assert_eq!(
        received.data.as_ref().and_then(|d| d.get("description")).and_then(|v| v.as_str()),
        Some("need help")
    );

    let only_once = timeout(Duration::from_millis(200), queen_rx.recv()).await;
    assert!(only_once.is_err(), "queen should receive the blocker exactly once");

    group.stop(true).await;
}

/// Scenario 2b: the same blocker delivered to `inbox-queen` actually drives
/// the coordinator's dispatch path — not just transport delivery — so the
/// reporting agent's state flips to blocked with its description recorded.
#[tokio::test]
async fn blocker_on_queen_inbox_updates_agent_state() {
    let dir = tempdir().unwrap();
    let group_path = dir.path().join("blocker-dispatch-swarm");
    let group = ChannelGroup::new(&group_path, vec![ChannelDef::new(layout::QUEEN_INBOX)]);
    group.start().await.unwrap();

    state::reset();
    state::set_swarm_state(
        SwarmStateInner::new(None, group_path.clone(), None),
        StateCallbacks::default(),
    );
    state::register_agent(AgentInfo::new("a2", AgentRole::Agent, None, "investigate the outage")).await;

    let inbox_sock = group.socket_path(layout::QUEEN_INBOX);
    let queen = ChannelClient::new(&inbox_sock);
    let a2 = ChannelClient::new(&inbox_sock);
    let mut queen_rx = queen.subscribe();
    queen.connect().await.unwrap();
    a2.connect().await.unwrap();

    let dispatcher = tokio::spawn(async move {
        let activity = pi_swarm::swarm::activity::ActivityStore::new();
        let message = next_message(&mut queen_rx).await;
        let from = message
            .data
            .as_ref()
            .and_then(|d| d.get("from"))
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();
        dispatch_message(&from, &message, &activity, None, None).await;
    });

    let mut data = serde_json::Map::new();
    data.insert("type".to_string(), json!("blocker"));
    data.insert("from".to_string(), json!("a2"));
    data.insert("description".to_string(), json!("need help"));
    let message = Message::with_data("need help", data);
    a2.send(&message).await.unwrap();

    dispatcher.await.unwrap();

    let state = state::current_state().expect("swarm state installed");
    let agents = state.agents.lock().await;
    let agent = agents.get("a2").expect("a2 registered");
    assert_eq!(agent.status, AgentStatus::Blocked);
    assert_eq!(agent.blocker_description.as_deref(), Some("need help"));
    drop(agents);

    group.stop(true).await;
}

/// Scenario 3: an instruct sent on `a3`'s private inbox reaches only `a3`;
/// `a1` and `a2`, listening on their own inboxes, see nothing.
#[tokio::test]
async fn instruct_targets_single_agent_inbox() {
    let dir = tempdir().unwrap();
    let group_path = dir.path().join("instruct-swarm");
    let group = ChannelGroup::new(
        &group_path,
        vec![
            ChannelDef::new(layout::inbox_name("a1")),
            ChannelDef::new(layout::inbox_name("a2")),
            ChannelDef::new(layout::inbox_name("a3")),
        ],
    );
    group.start().await.unwrap();

    let a1 = ChannelClient::new(group.socket_path(&layout::inbox_name("a1")));
    let a2 = ChannelClient::new(group.socket_path(&layout::inbox_name("a2")));
    let a3 = ChannelClient::new(group.socket_path(&layout::inbox_name("a3")));
    let mut a1_rx = a1.subscribe();
    let mut a2_rx = a2.subscribe();
    let mut a3_rx = a3.subscribe();
    a1.connect().await.unwrap();
    a2.connect().await.unwrap();
    a3.connect().await.unwrap();

    let queen_to_a3 = ChannelClient::new(group.socket_path(&layout::inbox_name("a3")));
    queen_to_a3.connect().await.unwrap();

    let mut data = serde_json::Map::new();
    data.insert("type".to_string(), json!("instruct"));
    data.insert("from".to_string(), json!("queen"));
    data.insert("instruction".to_string(), json!("focus on tests"));
    let message = Message::with_data("focus on tests", data);
    queen_to_a3.send(&message).await.unwrap();

    let received = next_message(&mut a3_rx).await;
    assert_eq!(received.data_type(), Some("instruct"));

    assert!(timeout(Duration::from_millis(200), a1_rx.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(200), a2_rx.recv()).await.is_err());

    group.stop(true).await;
}
