//! The thin request API in front of the coordinator machine.
//!
//! Commands are submitted to coordinator servers with a per-command timeout, failing
//! over to the next server until one answers; queries run against the local replica
//! first and escalate to a consistent quorum read when the local answer is missing or
//! points at a dead pid. Nothing here mutates machine state directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::timeout;

use crate::aux::LogProcessClient;
use crate::config::Config;
use crate::error::{CoordinatorError, DisallowedReason};
use crate::models::{Command, NodeId, PeerHandle, Query, QueryOutput, Reply, StreamConf, StreamId};

/// The maximum wall-clock skew allowed across replica write offsets before a new
/// replica may not join, in milliseconds.
pub const MAX_REPLICA_SKEW_MS: u64 = 10_000;

/// Transport used to reach coordinator servers.
#[async_trait]
pub trait CoordinatorTransport: Send + Sync + 'static {
    /// Submit a command to the given server, returning its synchronous reply.
    async fn submit(&self, server: &NodeId, cmd: Command) -> Result<Reply>;
    /// Run a read-only query against the local replica.
    async fn local_query(&self, query: Query) -> Result<QueryOutput, CoordinatorError>;
    /// Run a read-only query with quorum consistency.
    async fn consistent_query(&self, query: Query) -> Result<QueryOutput, CoordinatorError>;
}

/// A client handle to the replicated coordinator.
pub struct CoordinatorClient<T: CoordinatorTransport, L: LogProcessClient> {
    /// The application's runtime config.
    config: Arc<Config>,
    /// Transport to the coordinator servers.
    transport: Arc<T>,
    /// Client used to consult live log processes (liveness & replication state).
    log: Arc<L>,
    /// The known coordinator servers, tried in order.
    servers: Vec<NodeId>,
}

impl<T: CoordinatorTransport, L: LogProcessClient> CoordinatorClient<T, L> {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, transport: Arc<T>, log: Arc<L>, servers: Vec<NodeId>) -> Self {
        Self { config, transport, log, servers }
    }

    /// Submit a command, failing over across the known servers.
    #[tracing::instrument(level = "trace", skip(self, cmd))]
    pub async fn submit_command(&self, cmd: Command) -> Result<Reply, CoordinatorError> {
        let per_server = Duration::from_secs(self.config.command_timeout_secs);
        for server in &self.servers {
            match timeout(per_server, self.transport.submit(server, cmd.clone())).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(err)) => {
                    tracing::warn!(error = ?err, server = %server, "error submitting command, trying next server");
                }
                Err(_) => {
                    tracing::warn!(server = %server, "timeout submitting command, trying next server");
                }
            }
        }
        Err(CoordinatorError::CoordinatorUnavailable)
    }

    /// Create a new stream.
    pub async fn create_stream(&self, id: StreamId, conf: StreamConf) -> Result<Reply, CoordinatorError> {
        self.submit_command(Command::NewStream { id, conf, reply_to: None }).await
    }

    /// Delete a stream.
    pub async fn delete_stream(&self, id: StreamId) -> Result<Reply, CoordinatorError> {
        self.submit_command(Command::DeleteStream { id }).await
    }

    /// Add a replica on the given node.
    ///
    /// Guarded by the freshness gate: the current writer is asked for its replicas'
    /// replication state, and if the write offsets span more than ten seconds of
    /// wall-clock skew the request is refused without ever being submitted. The gate
    /// runs here, in the caller, against live state; it is intentionally not replicated.
    pub async fn add_replica(&self, id: StreamId, node: NodeId) -> Result<Reply, CoordinatorError> {
        let writer = self.writer_pid(&id).await?;
        let state = match self.log.replication_state(&writer).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = ?err, stream = %id, "error reading replication state from writer");
                return Err(CoordinatorError::CoordinatorUnavailable);
            }
        };
        let newest = state.values().map(|(_, millis)| *millis).max().unwrap_or(0);
        let oldest = state.values().map(|(_, millis)| *millis).min().unwrap_or(0);
        if newest.saturating_sub(oldest) > MAX_REPLICA_SKEW_MS {
            return Err(CoordinatorError::Disallowed(DisallowedReason::OutOfSyncReplica));
        }
        self.submit_command(Command::AddReplica { id, node }).await
    }

    /// Delete the replica on the given node.
    pub async fn delete_replica(&self, id: StreamId, node: NodeId) -> Result<Reply, CoordinatorError> {
        self.submit_command(Command::DeleteReplica { id, node }).await
    }

    /// The pid of the stream's running writer.
    pub async fn writer_pid(&self, id: &StreamId) -> Result<PeerHandle, CoordinatorError> {
        match self.query_pid_local(Query::WriterPid(id.clone())).await {
            Some(pid) => Ok(pid),
            None => match self.consistent_query(Query::WriterPid(id.clone())).await? {
                QueryOutput::Pid(pid) => Ok(pid),
                _ => Err(CoordinatorError::WriterNotFound),
            },
        }
    }

    /// The pid of the stream's running member on the given node.
    pub async fn local_pid(&self, id: &StreamId, node: &NodeId) -> Result<PeerHandle, CoordinatorError> {
        match self.query_pid_local(Query::LocalPid(id.clone(), node.clone())).await {
            Some(pid) => Ok(pid),
            None => match self.consistent_query(Query::LocalPid(id.clone(), node.clone())).await? {
                QueryOutput::Pid(pid) => Ok(pid),
                _ => Err(CoordinatorError::NotFound),
            },
        }
    }

    /// All members of the stream with their pids & roles.
    pub async fn members(&self, id: &StreamId) -> Result<QueryOutput, CoordinatorError> {
        match self.transport.local_query(Query::Members(id.clone())).await {
            Ok(output) => Ok(output),
            Err(CoordinatorError::NotFound) | Err(CoordinatorError::StreamNotFound) => self.consistent_query(Query::Members(id.clone())).await,
            Err(err) => Err(err),
        }
    }

    /// Run a pid query against the local replica, returning the pid only when it is
    /// found and alive on its node.
    async fn query_pid_local(&self, query: Query) -> Option<PeerHandle> {
        let pid = match self.transport.local_query(query).await {
            Ok(QueryOutput::Pid(pid)) => pid,
            _ => return None,
        };
        match self.log.is_alive(&pid).await {
            Ok(true) => Some(pid),
            _ => None,
        }
    }

    /// Run a consistent quorum query, mapping an expired deadline to a timeout error.
    async fn consistent_query(&self, query: Query) -> Result<QueryOutput, CoordinatorError> {
        let deadline = Duration::from_secs(self.config.command_timeout_secs);
        match timeout(deadline, self.transport.consistent_query(query)).await {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::Timeout),
        }
    }
}
