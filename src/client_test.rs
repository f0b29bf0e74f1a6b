use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::aux::LogProcessClient;
use crate::client::{CoordinatorClient, CoordinatorTransport};
use crate::config::Config;
use crate::error::{CoordinatorError, DisallowedReason};
use crate::fixtures::{node, pid};
use crate::models::{Command, Epoch, NodeId, PeerHandle, Query, QueryOutput, Reply, StreamConf, StreamId, Tail};

/// A transport with scripted per-server submit behavior and scripted query answers.
struct MockTransport {
    failing: Vec<NodeId>,
    attempts: Mutex<Vec<NodeId>>,
    local: Result<QueryOutput, CoordinatorError>,
    consistent: Result<QueryOutput, CoordinatorError>,
}

impl MockTransport {
    fn new(failing: Vec<NodeId>, local: Result<QueryOutput, CoordinatorError>, consistent: Result<QueryOutput, CoordinatorError>) -> Self {
        Self { failing, attempts: Mutex::new(Vec::new()), local, consistent }
    }
}

#[async_trait]
impl CoordinatorTransport for MockTransport {
    async fn submit(&self, server: &NodeId, _cmd: Command) -> Result<Reply> {
        self.attempts.lock().await.push(server.clone());
        if self.failing.contains(server) {
            bail!("server unreachable")
        }
        Ok(Reply::Ok)
    }
    async fn local_query(&self, _query: Query) -> Result<QueryOutput, CoordinatorError> {
        self.local.clone()
    }
    async fn consistent_query(&self, _query: Query) -> Result<QueryOutput, CoordinatorError> {
        self.consistent.clone()
    }
}

/// A log client with a scripted liveness answer and replication state.
struct MockLog {
    alive: bool,
    replication: BTreeMap<NodeId, (u64, u64)>,
}

#[async_trait]
impl LogProcessClient for MockLog {
    async fn start_writer(&self, _stream: &StreamId, _conf: &StreamConf, _node: &NodeId) -> Result<PeerHandle> {
        bail!("not used in client tests")
    }
    async fn start_replica(&self, _stream: &StreamId, _conf: &StreamConf, _node: &NodeId, _leader: &PeerHandle) -> Result<PeerHandle> {
        bail!("not used in client tests")
    }
    async fn stop(&self, _stream: &StreamId, _conf: &StreamConf, _node: &NodeId, _epoch: Epoch) -> Result<Tail> {
        bail!("not used in client tests")
    }
    async fn delete_member(&self, _stream: &StreamId, _node: &NodeId) -> Result<()> {
        bail!("not used in client tests")
    }
    async fn update_retention(&self, _stream: &StreamId, _conf: &StreamConf, _node: &NodeId) -> Result<()> {
        bail!("not used in client tests")
    }
    async fn replication_state(&self, _pid: &PeerHandle) -> Result<BTreeMap<NodeId, (u64, u64)>> {
        Ok(self.replication.clone())
    }
    async fn is_alive(&self, _pid: &PeerHandle) -> Result<bool> {
        Ok(self.alive)
    }
}

fn client(transport: MockTransport, log: MockLog, servers: &[&str]) -> (CoordinatorClient<MockTransport, MockLog>, Arc<MockTransport>) {
    let transport = Arc::new(transport);
    let client = CoordinatorClient::new(
        Config::new_test(),
        transport.clone(),
        Arc::new(log),
        servers.iter().map(|name| node(name)).collect(),
    );
    (client, transport)
}

fn skewed(entries: &[(&str, u64, u64)]) -> BTreeMap<NodeId, (u64, u64)> {
    entries.iter().map(|(name, offset, millis)| (node(name), (*offset, *millis))).collect()
}

#[tokio::test]
async fn submit_fails_over_to_the_next_server() -> Result<()> {
    let transport = MockTransport::new(vec![node("s1")], Err(CoordinatorError::NotFound), Err(CoordinatorError::NotFound));
    let (client, transport) = client(transport, MockLog { alive: true, replication: BTreeMap::new() }, &["s1", "s2"]);

    let reply = client.delete_stream(StreamId::from("orders")).await?;
    assert_eq!(reply, Reply::Ok);
    assert_eq!(transport.attempts.lock().await.clone(), vec![node("s1"), node("s2")], "the failed server is skipped");
    Ok(())
}

#[tokio::test]
async fn submit_reports_unavailable_when_every_server_fails() -> Result<()> {
    let transport = MockTransport::new(vec![node("s1"), node("s2")], Err(CoordinatorError::NotFound), Err(CoordinatorError::NotFound));
    let (client, transport) = client(transport, MockLog { alive: true, replication: BTreeMap::new() }, &["s1", "s2"]);

    let res = client.delete_stream(StreamId::from("orders")).await;
    assert_eq!(res, Err(CoordinatorError::CoordinatorUnavailable));
    assert_eq!(transport.attempts.lock().await.len(), 2, "every server is tried before giving up");
    Ok(())
}

#[tokio::test]
async fn writer_pid_escalates_to_quorum_when_local_misses() -> Result<()> {
    let quorum_pid = pid("n1");
    let transport = MockTransport::new(vec![], Err(CoordinatorError::StreamNotFound), Ok(QueryOutput::Pid(quorum_pid.clone())));
    let (client, _transport) = client(transport, MockLog { alive: true, replication: BTreeMap::new() }, &["s1"]);

    let found = client.writer_pid(&StreamId::from("orders")).await?;
    assert_eq!(found, quorum_pid, "a local miss escalates to the consistent query");
    Ok(())
}

#[tokio::test]
async fn writer_pid_escalates_when_local_answer_is_dead() -> Result<()> {
    let stale_pid = pid("n1");
    let fresh_pid = pid("n2");
    let transport = MockTransport::new(vec![], Ok(QueryOutput::Pid(stale_pid)), Ok(QueryOutput::Pid(fresh_pid.clone())));
    let (client, _transport) = client(transport, MockLog { alive: false, replication: BTreeMap::new() }, &["s1"]);

    let found = client.writer_pid(&StreamId::from("orders")).await?;
    assert_eq!(found, fresh_pid, "a dead local pid escalates to the consistent query");
    Ok(())
}

#[tokio::test]
async fn local_answer_is_used_when_alive() -> Result<()> {
    let local_pid = pid("n1");
    let transport = MockTransport::new(vec![], Ok(QueryOutput::Pid(local_pid.clone())), Err(CoordinatorError::WriterNotFound));
    let (client, _transport) = client(transport, MockLog { alive: true, replication: BTreeMap::new() }, &["s1"]);

    let found = client.writer_pid(&StreamId::from("orders")).await?;
    assert_eq!(found, local_pid);
    Ok(())
}

#[tokio::test]
async fn add_replica_is_refused_when_replicas_are_out_of_sync() -> Result<()> {
    let writer = pid("n1");
    let transport = MockTransport::new(vec![], Ok(QueryOutput::Pid(writer)), Err(CoordinatorError::WriterNotFound));
    // n2's last write is more than ten seconds behind n1's.
    let log = MockLog { alive: true, replication: skewed(&[("n1", 100, 30_000), ("n2", 80, 8_000)]) };
    let (client, _transport) = client(transport, log, &["s1"]);

    let res = client.add_replica(StreamId::from("orders"), node("n3")).await;
    assert_eq!(res, Err(CoordinatorError::Disallowed(DisallowedReason::OutOfSyncReplica)));
    Ok(())
}

#[tokio::test]
async fn add_replica_submits_when_replicas_are_fresh() -> Result<()> {
    let writer = pid("n1");
    let transport = MockTransport::new(vec![], Ok(QueryOutput::Pid(writer)), Err(CoordinatorError::WriterNotFound));
    let log = MockLog { alive: true, replication: skewed(&[("n1", 100, 30_000), ("n2", 99, 25_000)]) };
    let (client, transport) = client(transport, log, &["s1"]);

    let reply = client.add_replica(StreamId::from("orders"), node("n3")).await?;
    assert_eq!(reply, Reply::Ok);
    assert_eq!(transport.attempts.lock().await.len(), 1, "the gate passes and the command is submitted");
    Ok(())
}
