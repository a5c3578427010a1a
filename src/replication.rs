//! Primary/replica replication: handshake, propagation, and
//! acknowledgement-offset accounting (spec §4.3).

use std::net::SocketAddr;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};

use crate::error::ReplicationError;
use crate::resp::{self, Value};

/// A minimal, always-valid RDB payload used as the PSYNC bulk transfer.
/// RDB *writing* is a non-goal (spec §4.3 Non-goals); this is just enough
/// framing for a replica's handshake reader to consume and discard.
pub fn empty_rdb_payload() -> Vec<u8> {
    let mut out = b"REDIS0011".to_vec();
    out.push(0xFF);
    out
}

fn generate_replid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica { host: String, port: u16 },
}

/// A registered replica connection: propagated bytes are pushed through
/// `sender` to that connection's dedicated writer task.
pub struct ReplicaHandle {
    pub addr: SocketAddr,
    pub sender: mpsc::Sender<Vec<u8>>,
    pub ack_offset: u64,
}

pub struct ReplicationState {
    pub role: RwLock<Role>,
    pub replid: String,
    pub offset: RwLock<u64>,
    pub replicas: RwLock<Vec<ReplicaHandle>>,
}

impl ReplicationState {
    pub fn new() -> Arc<Self> {
        Arc::new(ReplicationState {
            role: RwLock::new(Role::Primary),
            replid: generate_replid(),
            offset: RwLock::new(0),
            replicas: RwLock::new(Vec::new()),
        })
    }

    pub async fn set_replica_of(&self, host: String, port: u16) {
        *self.role.write().await = Role::Replica { host, port };
    }

    pub async fn is_replica(&self) -> bool {
        matches!(*self.role.read().await, Role::Replica { .. })
    }

    pub async fn register_replica(&self, addr: SocketAddr, sender: mpsc::Sender<Vec<u8>>) {
        let mut replicas = self.replicas.write().await;
        replicas.push(ReplicaHandle { addr, sender, ack_offset: 0 });
    }

    pub async fn update_ack(&self, addr: SocketAddr, offset: u64) {
        let mut replicas = self.replicas.write().await;
        if let Some(r) = replicas.iter_mut().find(|r| r.addr == addr) {
            r.ack_offset = offset;
        }
    }

    pub async fn deregister_replica(&self, addr: SocketAddr) {
        self.replicas.write().await.retain(|r| r.addr != addr);
    }

    /// Sends `REPLCONF GETACK *` to every registered replica (spec §4.3:
    /// "sent to all replicas on demand").
    pub async fn send_getack_to_all(&self) {
        let getack = resp::encode_command(&["REPLCONF", "GETACK", "*"]);
        let snapshot: Vec<mpsc::Sender<Vec<u8>>> = {
            let replicas = self.replicas.read().await;
            replicas.iter().map(|r| r.sender.clone()).collect()
        };
        for sender in snapshot {
            let _ = sender.send(getack.clone()).await;
        }
    }

    /// Propagates `bytes` (an encoded command) to every registered
    /// replica and advances the replication offset. Propagation fans out
    /// over a snapshot of the registry taken under a read lock rather
    /// than the live map, so a slow/dead replica can't stall the others;
    /// replicas whose channel has closed are dropped in a follow-up write
    /// pass (spec §5 replica fan-out).
    pub async fn propagate(&self, bytes: &[u8]) {
        {
            let mut offset = self.offset.write().await;
            *offset += bytes.len() as u64;
        }
        let snapshot: Vec<(SocketAddr, mpsc::Sender<Vec<u8>>)> = {
            let replicas = self.replicas.read().await;
            replicas.iter().map(|r| (r.addr, r.sender.clone())).collect()
        };
        let mut dead = Vec::new();
        for (addr, sender) in snapshot {
            if sender.send(bytes.to_vec()).await.is_err() {
                dead.push(addr);
            }
        }
        if !dead.is_empty() {
            let mut replicas = self.replicas.write().await;
            replicas.retain(|r| !dead.contains(&r.addr));
        }
    }

    pub async fn current_offset(&self) -> u64 {
        *self.offset.read().await
    }

    /// Builds the `INFO replication` body (spec §4.2a), mirroring the
    /// teacher's `ReplicationConfig::get_info` line-by-line shape.
    pub async fn info_section(&self) -> String {
        let role = self.role.read().await;
        let offset = self.current_offset().await;
        let mut out = String::new();
        match &*role {
            Role::Primary => {
                out.push_str("role:master\r\n");
                out.push_str(&format!("master_replid:{}\r\n", self.replid));
                out.push_str(&format!("master_repl_offset:{}\r\n", offset));
                let replicas = self.replicas.read().await;
                for (i, r) in replicas.iter().enumerate() {
                    out.push_str(&format!(
                        "slave{}:ip={},port={},state=online,offset={}\r\n",
                        i,
                        r.addr.ip(),
                        r.addr.port(),
                        r.ack_offset
                    ));
                }
            }
            Role::Replica { host, port } => {
                out.push_str("role:slave\r\n");
                out.push_str(&format!("master_host:{}\r\n", host));
                out.push_str(&format!("master_port:{}\r\n", port));
                out.push_str("master_link_status:up\r\n");
                out.push_str(&format!("master_replid:{}\r\n", self.replid));
                out.push_str(&format!("master_repl_offset:{}\r\n", offset));
            }
        }
        out
    }

    pub fn fullresync_reply(&self, offset: u64) -> Value {
        Value::SimpleString(format!("FULLRESYNC {} {}", self.replid, offset))
    }
}

/// The exact wire length of a command once re-encoded as a RESP array of
/// bulks; used on the replica side to advance the processed-offset
/// counter (spec §4.3, §9: offsets are measured in propagation-stream
/// bytes, and every propagated command is sent in this canonical form).
pub fn command_wire_len(name: &str, args: &[String]) -> u64 {
    let mut parts: Vec<&str> = Vec::with_capacity(args.len() + 1);
    parts.push(name);
    for a in args {
        parts.push(a);
    }
    resp::encode_command(&parts).len() as u64
}

pub fn build_ack(offset: u64) -> Value {
    Value::array_of_bulks(["REPLCONF", "ACK", &offset.to_string()])
}

/// Drives the four-step replica handshake against an already-connected
/// primary socket (spec §4.3), then consumes and discards the bulk RDB
/// payload. Returns the primary's reported replid and starting offset.
pub async fn perform_handshake<S>(stream: &mut S, listening_port: u16) -> Result<(String, u64), ReplicationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_and_expect_simple(stream, &["PING"]).await?;
    send_and_expect_simple(stream, &["REPLCONF", "listening-port", &listening_port.to_string()]).await?;
    send_and_expect_simple(stream, &["REPLCONF", "capa", "psync2"]).await?;

    let psync = resp::encode_command(&["PSYNC", "?", "-1"]);
    tokio::io::AsyncWriteExt::write_all(stream, &psync).await?;
    tokio::io::AsyncWriteExt::flush(stream).await?;
    let reply = resp::decode_value(stream).await?;
    let Value::SimpleString(line) = reply else {
        return Err(ReplicationError::Handshake("expected FULLRESYNC reply".into()));
    };
    let mut parts = line.split_whitespace();
    let tag = parts.next().unwrap_or("");
    if tag != "FULLRESYNC" {
        return Err(ReplicationError::Handshake(format!("unexpected reply: {line}")));
    }
    let replid = parts
        .next()
        .ok_or_else(|| ReplicationError::Handshake("missing replid in FULLRESYNC".into()))?
        .to_string();
    let offset: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReplicationError::Handshake("missing offset in FULLRESYNC".into()))?;

    resp::read_rdb_bulk(stream).await?; // discarded: spec §4.3, §9 decision

    Ok((replid, offset))
}

async fn send_and_expect_simple<S>(stream: &mut S, args: &[&str]) -> Result<(), ReplicationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let encoded = resp::encode_command(args);
    tokio::io::AsyncWriteExt::write_all(stream, &encoded).await?;
    tokio::io::AsyncWriteExt::flush(stream).await?;
    match resp::decode_value(stream).await? {
        Value::SimpleString(_) => Ok(()),
        other => Err(ReplicationError::Handshake(format!("unexpected reply to {args:?}: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn propagate_advances_offset_and_fans_out() {
        let repl = ReplicationState::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:6380".parse().unwrap();
        repl.register_replica(addr, tx1).await;

        repl.propagate(b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(repl.current_offset().await, 14);
        let received = rx1.recv().await.unwrap();
        assert_eq!(received, b"*1\r\n$4\r\nPING\r\n".to_vec());

        drop(tx1);
    }

    #[tokio::test]
    async fn dead_replica_is_evicted_on_propagate() {
        let repl = ReplicationState::new();
        let (tx, rx) = mpsc::channel(1);
        let addr: SocketAddr = "127.0.0.1:6380".parse().unwrap();
        repl.register_replica(addr, tx).await;
        drop(rx);

        repl.propagate(b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(repl.replicas.read().await.len(), 0);
    }

    #[tokio::test]
    async fn ack_updates_tracked_offset() {
        let repl = ReplicationState::new();
        let (tx, _rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:6380".parse().unwrap();
        repl.register_replica(addr, tx).await;
        repl.update_ack(addr, 42).await;
        assert_eq!(repl.replicas.read().await[0].ack_offset, 42);
    }

    #[test]
    fn wire_len_matches_reencoded_command() {
        let len = command_wire_len("SET", &["k".to_string(), "v".to_string()]);
        assert_eq!(len, resp::encode_command(&["SET", "k", "v"]).len() as u64);
    }

    #[tokio::test]
    async fn handshake_walks_all_four_steps_and_reads_fullresync() {
        use tokio::io::duplex;

        let (mut client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            for _ in 0..3 {
                let _ = resp::decode_value(&mut server).await.unwrap();
                let ok = Value::ok();
                tokio::io::AsyncWriteExt::write_all(&mut server, &ok.to_bytes()).await.unwrap();
            }
            let _ = resp::decode_value(&mut server).await.unwrap(); // PSYNC
            let reply = Value::SimpleString("FULLRESYNC abc123 0".to_string());
            tokio::io::AsyncWriteExt::write_all(&mut server, &reply.to_bytes()).await.unwrap();
            resp::write_rdb_bulk(&mut server, &empty_rdb_payload()).await.unwrap();
        });

        let (replid, offset) = perform_handshake(&mut client, 6380).await.unwrap();
        assert_eq!(replid, "abc123");
        assert_eq!(offset, 0);
        server_task.await.unwrap();
    }
}
