// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for all three deployment topologies.
//!
//! | Topology | Command transport | Pub/sub | Scan |
//! |---|---|---|---|
//! | single | `aio::ConnectionManager` | same client | `SCAN` on the node |
//! | cluster | `cluster_async::ClusterConnection`, one slot per pipeline | first seed node | `SCAN` on every master from `CLUSTER NODES` |
//! | sentinel | `ConnectionManager` to the discovered primary | primary | `SCAN` on the primary |
//!
//! Multi-step operations that must be atomic on one key (fixed-window
//! counting, token-checked delete/extend) run as Lua scripts, which keeps
//! them single round trips and valid under cluster slot routing.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{cmd, pipe, Client, ConnectionAddr, ConnectionInfo, Pipeline, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, Command, Connector, Reply, Subscription, Topology};
use crate::config::BackendConfig;
use crate::resilience::retry::{retry, RetryConfig};

/// INCR the window counter, arm its expiry on first hit, report count + PTTL.
const WINDOW_INCR_SCRIPT: &str = r"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {current, ttl}
";

const DELETE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const EXPIRE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const SCAN_BATCH: usize = 100;

#[derive(Clone)]
enum Transport {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

pub struct RedisBackend {
    topology: Topology,
    transport: Transport,
    /// Clients used for pub/sub and per-node scans
    node_clients: Vec<Client>,
    nodes: Vec<String>,
    command_timeout: Duration,
}

impl RedisBackend {
    /// Connect according to the configured topology.
    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let connect_timeout = config.connect_timeout();
        match config.topology {
            Topology::Single => {
                let client = Client::open(config.url.as_str()).map_err(|e| to_backend_error(e, connect_timeout))?;
                let manager = with_timeout(connect_timeout, open_manager(client.clone(), connect_timeout)).await?;
                info!(url = %config.url, "Connected to Redis (single node)");
                Ok(Self {
                    topology: Topology::Single,
                    transport: Transport::Single(manager),
                    node_clients: vec![client],
                    nodes: vec![config.url.clone()],
                    command_timeout: config.command_timeout(),
                })
            }
            Topology::Cluster => {
                let mut builder = ClusterClientBuilder::new(config.nodes.clone());
                if let Some(ref password) = config.password {
                    builder = builder.password(password.clone());
                }
                let cluster = builder.build().map_err(|e| to_backend_error(e, connect_timeout))?;
                let connection = with_timeout(connect_timeout, async {
                    cluster
                        .get_async_connection()
                        .await
                        .map_err(|e| to_backend_error(e, connect_timeout))
                })
                .await?;

                let node_clients = config
                    .nodes
                    .iter()
                    .map(|node| Client::open(node.as_str()).map_err(|e| to_backend_error(e, connect_timeout)))
                    .collect::<Result<Vec<_>, _>>()?;
                info!(nodes = config.nodes.len(), "Connected to Redis cluster");
                Ok(Self {
                    topology: Topology::Cluster,
                    transport: Transport::Cluster(connection),
                    node_clients,
                    nodes: config.nodes.clone(),
                    command_timeout: config.command_timeout(),
                })
            }
            Topology::Sentinel => {
                let master = config
                    .sentinel_master
                    .clone()
                    .ok_or_else(|| BackendError::Connection("sentinel_master not configured".into()))?;
                let client = with_timeout(connect_timeout, discover_primary(config, &master, connect_timeout)).await?;
                let manager = with_timeout(connect_timeout, open_manager(client.clone(), connect_timeout)).await?;
                info!(master = %master, sentinels = config.nodes.len(), "Connected to Redis primary via sentinel");
                Ok(Self {
                    topology: Topology::Sentinel,
                    transport: Transport::Single(manager),
                    node_clients: vec![client],
                    nodes: config.nodes.clone(),
                    command_timeout: config.command_timeout(),
                })
            }
        }
    }

    async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<Vec<Value>, BackendError> {
        let transport = self.transport.clone();
        let limit = self.command_timeout;
        with_timeout(limit, async move {
            match transport {
                Transport::Single(mut conn) => pipeline.query_async::<Vec<Value>>(&mut conn).await,
                Transport::Cluster(mut conn) => pipeline.query_async::<Vec<Value>>(&mut conn).await,
            }
            .map_err(|e| to_backend_error(e, limit))
        })
        .await
    }

    async fn run_cmd<T: redis::FromRedisValue>(&self, command: &redis::Cmd) -> Result<T, BackendError> {
        let transport = self.transport.clone();
        let limit = self.command_timeout;
        with_timeout(limit, async move {
            match transport {
                Transport::Single(mut conn) => command.query_async::<T>(&mut conn).await,
                Transport::Cluster(mut conn) => command.query_async::<T>(&mut conn).await,
            }
            .map_err(|e| to_backend_error(e, limit))
        })
        .await
    }

    /// Nodes to scan. In a cluster that is every master currently listed by
    /// `CLUSTER NODES`; the seed nodes are used when discovery fails.
    async fn scan_targets(&self) -> Vec<Client> {
        if self.topology != Topology::Cluster {
            return self.node_clients.clone();
        }
        let Some(seed) = self.node_clients.first().map(|c| c.get_connection_info().clone()) else {
            return Vec::new();
        };
        if !matches!(seed.addr, ConnectionAddr::Tcp(..)) {
            return self.node_clients.clone();
        }

        let listing = match self.run_cmd::<String>(cmd("CLUSTER").arg("NODES")).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "CLUSTER NODES failed; scanning seed nodes only");
                return self.node_clients.clone();
            }
        };
        let masters = parse_cluster_masters(&listing);
        if masters.is_empty() {
            return self.node_clients.clone();
        }
        debug!(masters = masters.len(), "Discovered cluster masters for scan");

        let limit = self.command_timeout;
        masters
            .into_iter()
            .filter_map(|(host, port)| {
                let info = ConnectionInfo {
                    addr: ConnectionAddr::Tcp(host, port),
                    redis: seed.redis.clone(),
                };
                Client::open(info)
                    .map_err(|e| warn!(error = %to_backend_error(e, limit), "Skipping unusable cluster master"))
                    .ok()
            })
            .collect()
    }

    async fn scan_node(&self, client: &Client, pattern: &str) -> Result<Vec<String>, BackendError> {
        let limit = self.command_timeout;
        let mut conn = with_timeout(limit, async {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| to_backend_error(e, limit))
        })
        .await?;

        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| to_backend_error(e, limit))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn topology(&self) -> Topology {
        self.topology
    }

    fn nodes(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let pong: String = self.run_cmd(&cmd("PING")).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        if self.topology == Topology::Cluster {
            let mut slots = commands.iter().filter_map(Command::slot);
            if let Some(first) = slots.next() {
                if slots.any(|slot| slot != first) {
                    return Err(BackendError::Protocol("pipeline spans multiple hash slots".into()));
                }
            }
        }
        let mut pipeline = pipe();
        for command in &commands {
            add_command(&mut pipeline, command);
        }
        let values = self.run_pipeline(&pipeline).await?;
        if values.len() != commands.len() {
            return Err(BackendError::Protocol(format!(
                "pipeline returned {} replies for {} commands",
                values.len(),
                commands.len()
            )));
        }
        values.into_iter().map(to_reply).collect()
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        // Replicas may report the same key; dedupe across nodes
        let mut keys = BTreeSet::new();
        for client in &self.scan_targets().await {
            match self.scan_node(client, pattern).await {
                Ok(batch) => keys.extend(batch),
                Err(e) if self.topology == Topology::Cluster => {
                    warn!(error = %e, "Skipping unreachable cluster node during scan");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let client = self
            .node_clients
            .first()
            .cloned()
            .ok_or_else(|| BackendError::Connection("no node available for subscription".into()))?;

        let limit = self.command_timeout;
        let mut pubsub = with_timeout(limit, async {
            client.get_async_pubsub().await.map_err(|e| to_backend_error(e, limit))
        })
        .await?;
        pubsub.subscribe(channel).await.map_err(|e| to_backend_error(e, limit))?;

        let (tx, rx) = mpsc::channel(1024);
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %name, error = %e, "Dropping non-UTF8 pub/sub payload"),
                }
            }
            debug!(channel = %name, "Pub/sub stream ended");
        });

        Ok(Subscription::new(channel, rx, forwarder))
    }

    async fn memory_bytes(&self) -> Result<Option<u64>, BackendError> {
        let info: String = self.run_cmd(cmd("INFO").arg("memory")).await?;
        Ok(parse_info_field(&info, "used_memory").and_then(|v| v.parse().ok()))
    }

    async fn cluster_state(&self) -> Result<Option<String>, BackendError> {
        if self.topology != Topology::Cluster {
            return Ok(None);
        }
        let info: String = self.run_cmd(cmd("CLUSTER").arg("INFO")).await?;
        Ok(parse_info_field(&info, "cluster_state").map(str::to_string))
    }
}

/// Builds a fresh [`RedisBackend`] for every (re)connection attempt.
pub struct RedisConnector {
    config: BackendConfig,
}

impl RedisConnector {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        let backend = RedisBackend::connect(&self.config).await?;
        Ok(Arc::new(backend))
    }
}

async fn open_manager(client: Client, limit: Duration) -> Result<ConnectionManager, BackendError> {
    // Short startup retry; longer outages are the connection manager's job
    retry("redis_connect", &RetryConfig::startup(), || {
        let client = client.clone();
        async move { ConnectionManager::new(client).await }
    })
    .await
    .map_err(|e| to_backend_error(e, limit))
}

async fn discover_primary(config: &BackendConfig, master: &str, limit: Duration) -> Result<Client, BackendError> {
    let mut sentinel =
        redis::sentinel::Sentinel::build(config.nodes.clone()).map_err(|e| to_backend_error(e, limit))?;
    let node_info = config.password.as_ref().map(|password| redis::sentinel::SentinelNodeConnectionInfo {
        tls_mode: None,
        redis_connection_info: Some(redis::RedisConnectionInfo {
            password: Some(password.clone()),
            ..Default::default()
        }),
    });
    sentinel
        .async_master_for(master, node_info.as_ref())
        .await
        .map_err(|e| to_backend_error(e, limit))
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

fn add_command(pipeline: &mut Pipeline, command: &Command) {
    match command {
        Command::Get { key } => {
            pipeline.cmd("GET").arg(key);
        }
        Command::SetEx { key, value, ttl } => {
            pipeline.cmd("SET").arg(key).arg(value.as_slice()).arg("PX").arg(ttl_millis(*ttl));
        }
        Command::SetNx { key, value, ttl } => {
            pipeline
                .cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(*ttl));
        }
        Command::Del { key } => {
            pipeline.cmd("DEL").arg(key);
        }
        Command::WindowIncr { key, ttl } => {
            let secs = ttl.as_secs().max(1);
            pipeline.cmd("EVAL").arg(WINDOW_INCR_SCRIPT).arg(1).arg(key).arg(secs);
        }
        Command::DeleteIfEquals { key, value } => {
            pipeline.cmd("EVAL").arg(DELETE_IF_EQUALS_SCRIPT).arg(1).arg(key).arg(value.as_slice());
        }
        Command::ExpireIfEquals { key, value, ttl } => {
            pipeline
                .cmd("EVAL")
                .arg(EXPIRE_IF_EQUALS_SCRIPT)
                .arg(1)
                .arg(key)
                .arg(value.as_slice())
                .arg(ttl_millis(*ttl));
        }
        Command::Publish { channel, message } => {
            pipeline.cmd("PUBLISH").arg(channel).arg(message);
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn to_reply(value: Value) -> Result<Reply, BackendError> {
    Ok(match value {
        Value::Nil => Reply::Nil,
        Value::Okay => Reply::Ok,
        Value::Int(n) => Reply::Int(n),
        Value::BulkString(bytes) => Reply::Bulk(bytes),
        Value::SimpleString(s) if s == "OK" => Reply::Ok,
        Value::SimpleString(s) => Reply::Bulk(s.into_bytes()),
        Value::Array(items) => Reply::Array(items.into_iter().map(to_reply).collect::<Result<_, _>>()?),
        Value::ServerError(err) => return Err(BackendError::Command(format!("{:?}", err))),
        other => return Err(BackendError::Protocol(format!("unsupported reply: {:?}", other))),
    })
}

/// Classify a client error. `limit` is the timeout the call ran under.
fn to_backend_error(err: redis::RedisError, limit: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(limit)
    } else if err.kind() == redis::ErrorKind::CrossSlot {
        BackendError::Protocol(err.to_string())
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        BackendError::Connection(err.to_string())
    } else if matches!(err.kind(), redis::ErrorKind::ClusterDown | redis::ErrorKind::MasterDown) {
        BackendError::Connection(err.to_string())
    } else {
        BackendError::Command(err.to_string())
    }
}

/// `(host, port)` of every reachable master in a `CLUSTER NODES` listing.
///
/// Line format: `<id> <ip:port@cport[,hostname]> <flags> <master-id> ...`.
fn parse_cluster_masters(listing: &str) -> Vec<(String, u16)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let address = fields.next()?;
            let flags: Vec<&str> = fields.next()?.split(',').collect();
            if !flags.contains(&"master") || flags.iter().any(|f| matches!(*f, "fail" | "noaddr" | "handshake")) {
                return None;
            }
            let endpoint = address.split(['@', ',']).next()?;
            let (host, port) = endpoint.rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            if host.is_empty() || port == 0 {
                return None;
            }
            Some((host.trim_matches(['[', ']']).to_string(), port))
        })
        .collect()
}

fn parse_info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| *name == field)
        .map(|(_, value)| value.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_field() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        assert_eq!(parse_info_field(info, "used_memory"), Some("1048576"));
        assert_eq!(parse_info_field(info, "missing"), None);

        let cluster = "cluster_state:ok\r\ncluster_slots_assigned:16384\r\n";
        assert_eq!(parse_info_field(cluster, "cluster_state"), Some("ok"));
    }

    #[test]
    fn test_to_reply_normalizes_values() {
        assert_eq!(to_reply(Value::Okay).unwrap(), Reply::Ok);
        assert_eq!(to_reply(Value::SimpleString("OK".into())).unwrap(), Reply::Ok);
        assert_eq!(to_reply(Value::Int(3)).unwrap(), Reply::Int(3));
        assert_eq!(
            to_reply(Value::Array(vec![Value::Int(1), Value::Int(900)])).unwrap(),
            Reply::Array(vec![Reply::Int(1), Reply::Int(900)])
        );
        assert_eq!(to_reply(Value::BulkString(b"x".to_vec())).unwrap(), Reply::Bulk(b"x".to_vec()));
    }

    #[test]
    fn test_error_classification() {
        let refused = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(to_backend_error(refused, Duration::from_secs(1)).is_connectivity());

        let down = redis::RedisError::from((redis::ErrorKind::ClusterDown, "cluster down"));
        assert!(to_backend_error(down, Duration::from_secs(1)).is_connectivity());

        let wrong_type = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(to_backend_error(wrong_type, Duration::from_secs(1)), BackendError::Command(_)));

        let cross_slot = redis::RedisError::from((redis::ErrorKind::CrossSlot, "crossed slots in pipeline"));
        let classified = to_backend_error(cross_slot, Duration::from_secs(1));
        assert!(matches!(classified, BackendError::Protocol(_)));
        assert!(!classified.is_connectivity());
    }

    #[test]
    fn test_timeout_carries_limit() {
        let timed_out = redis::RedisError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        let classified = to_backend_error(timed_out, Duration::from_millis(750));
        assert_eq!(classified, BackendError::Timeout(Duration::from_millis(750)));
        assert_eq!(classified.to_string(), "Backend operation timed out after 750ms");
    }

    #[test]
    fn test_parse_cluster_masters() {
        let listing = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,node-4 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002,node-2 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
a1b2c3d4e5f60718293a4b5c6d7e8f9012345678 10.0.0.9:30009@31009 master,fail - 0 1426238316232 9 disconnected
b1b2c3d4e5f60718293a4b5c6d7e8f9012345678 :0@0 master,noaddr - 0 0 0 disconnected
c1b2c3d4e5f60718293a4b5c6d7e8f9012345678 [2001:db8::1]:30010@31010 master - 0 1426238316232 10 connected
";
        let masters = parse_cluster_masters(listing);
        assert_eq!(
            masters,
            vec![
                ("127.0.0.1".to_string(), 30002),
                ("127.0.0.1".to_string(), 30003),
                ("127.0.0.1".to_string(), 30001),
                ("2001:db8::1".to_string(), 30010),
            ]
        );
        assert!(parse_cluster_masters("").is_empty());
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }
}
