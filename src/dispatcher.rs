//! Per-connection read loop and command routing (spec §4.5).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{CommandError, ReplicationError};
use crate::keyspace::{Keyspace, WRITE_COMMANDS};
use crate::pubsub::{PubSub, Subscription, SUBSCRIBED_MODE_ALLOW_LIST};
use crate::replication::{self, ReplicationState};
use crate::resp::{self, Value};
use crate::transactions::{TransactionState, TRANSACTION_COMMANDS};

/// Everything a connection task needs a handle to.
pub struct AppState {
    pub keyspace: Arc<Keyspace>,
    pub config: Arc<Config>,
    pub replication: Arc<ReplicationState>,
    pub pubsub: Arc<PubSub>,
}

fn command_error(e: CommandError) -> Value {
    Value::error(e.to_string())
}

fn ok_or_err(r: Result<Value, CommandError>) -> Value {
    match r {
        Ok(v) => v,
        Err(e) => command_error(e),
    }
}

fn arity(cmd: &str) -> Value {
    command_error(CommandError::Arity(cmd.to_lowercase()))
}

/// Reads frames off the socket in a dedicated task and forwards each
/// decoded command to `tx`. Kept separate from the connection's main
/// select loop so a cancelled select branch never drops a
/// partially-read frame (spec §5 cancellation discipline).
async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Value>) {
    loop {
        match resp::decode_value(&mut reader).await {
            Ok(value) => {
                if tx.send(value).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Drives one accepted client connection until it closes.
pub async fn handle_connection(state: Arc<AppState>, stream: TcpStream, addr: SocketAddr, conn_id: u64) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Value>(32);
    let reader_task = tokio::spawn(read_loop(read_half, cmd_tx));

    let mut subscription = Subscription::default();
    let mut transaction = TransactionState::default();
    let (pub_tx, mut pub_rx) = mpsc::channel::<Value>(64);

    loop {
        tokio::select! {
            maybe_value = cmd_rx.recv() => {
                let Some(value) = maybe_value else { break };
                let Some((name, args)) = resp::as_command(&value) else { continue };
                if name == "PSYNC" {
                    tracing::info!(conn_id, %addr, "promoting connection to replica link");
                    promote_to_replica(&state, addr, conn_id, cmd_rx, write_half).await;
                    reader_task.abort();
                    return;
                }
                let quitting = name == "QUIT";
                let replies = dispatch_command(&state, conn_id, &mut subscription, &mut transaction, name, args, &pub_tx).await;
                let mut io_failed = false;
                for reply in replies {
                    if matches!(reply, Value::NoResponse) {
                        continue;
                    }
                    if reply.write_to(&mut write_half).await.is_err() {
                        io_failed = true;
                        break;
                    }
                }
                if io_failed || quitting {
                    break;
                }
            }
            maybe_msg = pub_rx.recv() => {
                let Some(msg) = maybe_msg else { continue };
                if msg.write_to(&mut write_half).await.is_err() {
                    break;
                }
            }
            else => break,
        }
    }

    reader_task.abort();
    let channels = subscription.channels();
    state.pubsub.unsubscribe_all(conn_id, &channels).await;
    tracing::info!(conn_id, %addr, "connection closed");
}

/// After a PSYNC is accepted, the connection stops being a regular
/// client link: the write half carries propagated commands fed from the
/// replication registry, and the read half is watched only for
/// `REPLCONF ACK` replies (spec §4.3).
async fn promote_to_replica(
    state: &Arc<AppState>,
    addr: SocketAddr,
    conn_id: u64,
    mut cmd_rx: mpsc::Receiver<Value>,
    mut write_half: OwnedWriteHalf,
) {
    let offset = state.replication.current_offset().await;
    let fullresync = state.replication.fullresync_reply(offset);
    if fullresync.write_to(&mut write_half).await.is_err() {
        return;
    }
    if resp::write_rdb_bulk(&mut write_half, &replication::empty_rdb_payload()).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    state.replication.register_replica(addr, tx).await;

    loop {
        tokio::select! {
            maybe_bytes = rx.recv() => {
                let Some(bytes) = maybe_bytes else { break };
                if write_half.write_all(&bytes).await.is_err() || write_half.flush().await.is_err() {
                    break;
                }
            }
            maybe_value = cmd_rx.recv() => {
                let Some(value) = maybe_value else { break };
                if let Some((name, args)) = resp::as_command(&value) {
                    if name == "REPLCONF" && args.len() == 2 && args[0].eq_ignore_ascii_case("ACK") {
                        if let Ok(ack_offset) = args[1].parse::<u64>() {
                            state.replication.update_ack(addr, ack_offset).await;
                        }
                    }
                }
            }
            else => break,
        }
    }

    state.replication.deregister_replica(addr).await;
    tracing::info!(conn_id, %addr, "replica link closed");
}

/// Dials `host:port`, performs the replica handshake, and applies
/// propagated commands forever (spec §4.3). Returns on a fatal I/O or
/// handshake error; the caller decides whether to retry.
pub async fn run_replica_link(state: Arc<AppState>, host: String, port: u16) -> Result<(), ReplicationError> {
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;
    let my_port: u16 = state.config.get("port").await.and_then(|p| p.parse().ok()).unwrap_or(6379);
    let (replid, start_offset) = replication::perform_handshake(&mut stream, my_port).await?;
    tracing::info!(%host, port, replid, start_offset, "replica handshake complete");
    state.replication.set_replica_of(host, port).await;

    let mut subscription = Subscription::default();
    let mut transaction = TransactionState::default();
    let (pub_tx, _pub_rx) = mpsc::channel::<Value>(1);
    let mut processed_offset = start_offset;
    const REPLICA_LINK_CONN_ID: u64 = 0;

    loop {
        let value = match resp::decode_value(&mut stream).await {
            Ok(v) => v,
            Err(_) => break,
        };
        let Some((name, args)) = resp::as_command(&value) else { continue };
        let wire_len = replication::command_wire_len(&name, &args);

        if name == "REPLCONF" && args.first().map(|s| s.eq_ignore_ascii_case("GETACK")).unwrap_or(false) {
            let ack = replication::build_ack(processed_offset);
            if tokio::io::AsyncWriteExt::write_all(&mut stream, &ack.to_bytes()).await.is_err() {
                break;
            }
            let _ = tokio::io::AsyncWriteExt::flush(&mut stream).await;
            processed_offset += wire_len;
            continue;
        }

        let _ = dispatch_command(&state, REPLICA_LINK_CONN_ID, &mut subscription, &mut transaction, name, args, &pub_tx).await;
        processed_offset += wire_len;
    }
    Ok(())
}

/// Applies the routing rules in spec §4.5: subscribed-mode gating, then
/// transaction-queue gating, then execution (with propagation on a
/// write command).
pub async fn dispatch_command(
    state: &Arc<AppState>,
    conn_id: u64,
    subscription: &mut Subscription,
    transaction: &mut TransactionState,
    name: String,
    args: Vec<String>,
    pub_tx: &mpsc::Sender<Value>,
) -> Vec<Value> {
    if subscription.is_subscribed_mode() && !SUBSCRIBED_MODE_ALLOW_LIST.contains(&name.as_str()) {
        return vec![Value::error(format!(
            "ERR Can't execute '{}': only (P|S)SUBSCRIBE / (P|S)UNSUBSCRIBE / PING / QUIT / RESET are allowed in this context",
            name.to_lowercase()
        ))];
    }
    if transaction.is_active() && !TRANSACTION_COMMANDS.contains(&name.as_str()) {
        transaction.enqueue(name, args);
        return vec![Value::SimpleString("QUEUED".to_string())];
    }
    execute_one(state, conn_id, subscription, transaction, name, args, pub_tx).await
}

/// Executes one command and, on a primary, propagates it to replicas if
/// it's a write command. Boxed because EXEC replays queued commands
/// through this same function — without the indirection the recursive
/// `async fn` would need an infinitely-sized future.
fn execute_one<'a>(
    state: &'a Arc<AppState>,
    conn_id: u64,
    subscription: &'a mut Subscription,
    transaction: &'a mut TransactionState,
    name: String,
    args: Vec<String>,
    pub_tx: &'a mpsc::Sender<Value>,
) -> Pin<Box<dyn Future<Output = Vec<Value>> + Send + 'a>> {
    Box::pin(async move {
        let values = run_command(state, conn_id, subscription, transaction, &name, &args, pub_tx).await;
        if WRITE_COMMANDS.contains(&name.as_str()) && !state.replication.is_replica().await {
            let mut parts = Vec::with_capacity(args.len() + 1);
            parts.push(name.as_str());
            for a in &args {
                parts.push(a.as_str());
            }
            let bytes = resp::encode_command(&parts);
            state.replication.propagate(&bytes).await;
        }
        values
    })
}

async fn run_command(
    state: &Arc<AppState>,
    conn_id: u64,
    subscription: &mut Subscription,
    transaction: &mut TransactionState,
    name: &str,
    args: &[String],
    pub_tx: &mpsc::Sender<Value>,
) -> Vec<Value> {
    let ks = &state.keyspace;
    match name {
        "PING" => match args.len() {
            0 => vec![Keyspace::ping(None)],
            1 => vec![Keyspace::ping(Some(args[0].clone()))],
            _ => vec![arity("ping")],
        },
        "ECHO" => {
            if args.len() != 1 {
                vec![arity("echo")]
            } else {
                vec![Keyspace::echo(args[0].clone())]
            }
        }
        "TYPE" => {
            if args.len() != 1 {
                vec![arity("type")]
            } else {
                vec![ks.type_of(&args[0]).await]
            }
        }
        "SET" => vec![handle_set(ks, args).await],
        "GET" => {
            if args.len() != 1 {
                vec![arity("get")]
            } else {
                vec![ok_or_err(ks.get(&args[0]).await)]
            }
        }
        "INCR" => {
            if args.len() != 1 {
                vec![arity("incr")]
            } else {
                vec![ok_or_err(ks.incr(&args[0]).await)]
            }
        }
        "DEL" => {
            if args.is_empty() {
                vec![arity("del")]
            } else {
                vec![Value::Integer(ks.del(args).await)]
            }
        }
        "EXISTS" => {
            if args.is_empty() {
                vec![arity("exists")]
            } else {
                vec![Value::Integer(ks.exists(args).await)]
            }
        }
        "KEYS" => {
            if args.len() != 1 {
                vec![arity("keys")]
            } else {
                vec![ks.keys().await]
            }
        }
        "LPUSH" => vec![handle_push(ks, args, true).await],
        "RPUSH" => vec![handle_push(ks, args, false).await],
        "LLEN" => {
            if args.len() != 1 {
                vec![arity("llen")]
            } else {
                vec![ok_or_err(ks.llen(&args[0]).await)]
            }
        }
        "LRANGE" => vec![handle_lrange(ks, args).await],
        "LPOP" => vec![handle_pop(ks, args, true).await],
        "RPOP" => vec![handle_pop(ks, args, false).await],
        "BLPOP" => vec![handle_blpop(ks, args).await],
        "XADD" => vec![handle_xadd(ks, args).await],
        "XRANGE" => {
            if args.len() != 3 {
                vec![arity("xrange")]
            } else {
                vec![ok_or_err(ks.xrange(&args[0], &args[1], &args[2]).await)]
            }
        }
        "XREAD" => vec![handle_xread(ks, args).await],
        "MULTI" => {
            if !args.is_empty() {
                vec![arity("multi")]
            } else {
                transaction.begin();
                vec![Value::ok()]
            }
        }
        "EXEC" => handle_exec(state, conn_id, subscription, transaction, args, pub_tx).await,
        "DISCARD" => {
            if !args.is_empty() {
                vec![arity("discard")]
            } else if !transaction.is_active() {
                vec![command_error(CommandError::generic("DISCARD without MULTI"))]
            } else {
                transaction.discard();
                vec![Value::ok()]
            }
        }
        "WATCH" => {
            if args.is_empty() {
                vec![arity("watch")]
            } else {
                vec![Value::ok()]
            }
        }
        "RESET" => {
            subscription.clear();
            transaction.discard();
            vec![Value::SimpleString("RESET".to_string())]
        }
        "QUIT" => vec![Value::ok()],
        "SUBSCRIBE" => handle_subscribe(state, conn_id, subscription, args, pub_tx).await,
        "UNSUBSCRIBE" => handle_unsubscribe(state, conn_id, subscription, args).await,
        "PUBLISH" => {
            if args.len() != 2 {
                vec![arity("publish")]
            } else {
                vec![Value::Integer(state.pubsub.publish(&args[0], &args[1]).await)]
            }
        }
        "CONFIG" => vec![handle_config(state, args).await],
        "INFO" => vec![handle_info(state, args).await],
        "REPLCONF" => vec![handle_replconf(args)],
        _ => vec![Value::SimpleString(String::new())],
    }
}

async fn handle_set(ks: &Arc<Keyspace>, args: &[String]) -> Value {
    if args.len() != 2 && args.len() != 4 {
        return arity("set");
    }
    let mut px = None;
    if args.len() == 4 {
        if !args[2].eq_ignore_ascii_case("PX") {
            return command_error(CommandError::generic("syntax error"));
        }
        match args[3].parse::<u64>() {
            Ok(v) => px = Some(v),
            Err(_) => return command_error(CommandError::NotAnInteger),
        }
    }
    ks.set(args[0].clone(), args[1].clone().into_bytes(), px).await
}

async fn handle_push(ks: &Arc<Keyspace>, args: &[String], front: bool) -> Value {
    if args.len() < 2 {
        return arity(if front { "lpush" } else { "rpush" });
    }
    let values = args[1..].iter().map(|s| s.clone().into_bytes()).collect();
    let result = if front {
        ks.lpush(args[0].clone(), values).await
    } else {
        ks.rpush(args[0].clone(), values).await
    };
    ok_or_err(result)
}

async fn handle_lrange(ks: &Arc<Keyspace>, args: &[String]) -> Value {
    if args.len() != 3 {
        return arity("lrange");
    }
    let (Ok(start), Ok(stop)) = (args[1].parse::<i64>(), args[2].parse::<i64>()) else {
        return command_error(CommandError::NotAnInteger);
    };
    ok_or_err(ks.lrange(&args[0], start, stop).await)
}

async fn handle_pop(ks: &Arc<Keyspace>, args: &[String], front: bool) -> Value {
    if args.is_empty() || args.len() > 2 {
        return arity(if front { "lpop" } else { "rpop" });
    }
    let count = if args.len() == 2 {
        match args[1].parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => return command_error(CommandError::NotAnInteger),
        }
    } else {
        None
    };
    let result = if front { ks.lpop(&args[0], count).await } else { ks.rpop(&args[0], count).await };
    ok_or_err(result)
}

async fn handle_blpop(ks: &Arc<Keyspace>, args: &[String]) -> Value {
    if args.len() < 2 {
        return arity("blpop");
    }
    let (keys, timeout_arg) = args.split_at(args.len() - 1);
    let timeout_secs: f64 = match timeout_arg[0].parse() {
        Ok(t) => t,
        Err(_) => return command_error(CommandError::generic("timeout is not a float or out of range")),
    };
    if timeout_secs < 0.0 {
        return command_error(CommandError::generic("timeout is negative"));
    }
    ks.blpop(keys, Duration::from_secs_f64(timeout_secs)).await
}

async fn handle_xadd(ks: &Arc<Keyspace>, args: &[String]) -> Value {
    if args.len() < 4 || (args.len() - 2) % 2 != 0 {
        return arity("xadd");
    }
    let key = args[0].clone();
    let id_spec = &args[1];
    let mut fields = Vec::with_capacity((args.len() - 2) / 2);
    let mut i = 2;
    while i + 1 < args.len() {
        fields.push((args[i].clone(), args[i + 1].clone()));
        i += 2;
    }
    ok_or_err(ks.xadd(key, id_spec, fields).await)
}

fn parse_xread_args(args: &[String]) -> Result<(Option<u64>, Vec<String>, Vec<String>), CommandError> {
    let mut i = 0;
    let mut block = None;
    if args.get(i).map(|s| s.eq_ignore_ascii_case("BLOCK")).unwrap_or(false) {
        let ms = args
            .get(i + 1)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CommandError::generic("timeout is not an integer or out of range"))?;
        block = Some(ms);
        i += 2;
    }
    if !args.get(i).map(|s| s.eq_ignore_ascii_case("STREAMS")).unwrap_or(false) {
        return Err(CommandError::generic("syntax error"));
    }
    i += 1;
    let rest = &args[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(CommandError::generic(
            "Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified.",
        ));
    }
    let n = rest.len() / 2;
    Ok((block, rest[..n].to_vec(), rest[n..].to_vec()))
}

async fn handle_xread(ks: &Arc<Keyspace>, args: &[String]) -> Value {
    let (block, keys, id_tokens) = match parse_xread_args(args) {
        Ok(v) => v,
        Err(e) => return command_error(e),
    };
    let mut resolved = Vec::with_capacity(keys.len());
    for (key, token) in keys.iter().zip(id_tokens.iter()) {
        match ks.resolve_xread_id(key, token).await {
            Ok(id) => resolved.push(id),
            Err(e) => return command_error(e),
        }
    }
    ks.xread(&keys, &resolved, block).await
}


async fn handle_exec<'a>(
    state: &'a Arc<AppState>,
    conn_id: u64,
    subscription: &'a mut Subscription,
    transaction: &'a mut TransactionState,
    args: &[String],
    pub_tx: &'a mpsc::Sender<Value>,
) -> Vec<Value> {
    if !args.is_empty() {
        return vec![arity("exec")];
    }
    let Some(queue) = transaction.take() else {
        return vec![command_error(CommandError::generic("EXEC without MULTI"))];
    };
    let mut results = Vec::with_capacity(queue.len());
    for (qname, qargs) in queue {
        let mut values = execute_one(state, conn_id, subscription, transaction, qname, qargs, pub_tx).await;
        results.push(values.pop().unwrap_or(Value::NoResponse));
    }
    vec![Value::Array(results)]
}

async fn handle_subscribe(
    state: &Arc<AppState>,
    conn_id: u64,
    subscription: &mut Subscription,
    args: &[String],
    pub_tx: &mpsc::Sender<Value>,
) -> Vec<Value> {
    if args.is_empty() {
        return vec![arity("subscribe")];
    }
    let mut replies = Vec::with_capacity(args.len());
    for channel in args {
        subscription.add(channel);
        state.pubsub.subscribe(channel, conn_id, pub_tx.clone()).await;
        replies.push(Value::Array(vec![
            Value::bulk_str("subscribe"),
            Value::bulk_str(channel.clone()),
            Value::Integer(subscription.channel_count() as i64),
        ]));
    }
    replies
}

async fn handle_unsubscribe(state: &Arc<AppState>, conn_id: u64, subscription: &mut Subscription, args: &[String]) -> Vec<Value> {
    let channels: Vec<String> = if args.is_empty() { subscription.channels() } else { args.to_vec() };
    if channels.is_empty() {
        return vec![Value::Array(vec![Value::bulk_str("unsubscribe"), Value::NullBulk, Value::Integer(0)])];
    }
    let mut replies = Vec::with_capacity(channels.len());
    for channel in &channels {
        subscription.remove(channel);
        state.pubsub.unsubscribe(channel, conn_id).await;
        replies.push(Value::Array(vec![
            Value::bulk_str("unsubscribe"),
            Value::bulk_str(channel.clone()),
            Value::Integer(subscription.channel_count() as i64),
        ]));
    }
    replies
}

async fn handle_config(state: &Arc<AppState>, args: &[String]) -> Value {
    if args.len() != 2 || !args[0].eq_ignore_ascii_case("GET") {
        return arity("config");
    }
    let param = &args[1];
    match state.config.get(param).await {
        Some(value) => Value::array_of_bulks([param.clone(), value]),
        None => Value::Array(Vec::new()),
    }
}

async fn handle_info(state: &Arc<AppState>, args: &[String]) -> Value {
    let section_is_replication = args.is_empty() || args[0].eq_ignore_ascii_case("replication");
    if !section_is_replication {
        return Value::Bulk(Vec::new());
    }
    Value::Bulk(state.replication.info_section().await.into_bytes())
}

fn handle_replconf(args: &[String]) -> Value {
    match args.first().map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "listening-port" || s == "capa" => Value::ok(),
        _ => command_error(CommandError::generic("unknown REPLCONF subcommand")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> Arc<AppState> {
        Arc::new(AppState {
            keyspace: Keyspace::new(),
            config: Config::new(),
            replication: ReplicationState::new(),
            pubsub: PubSub::new(),
        })
    }

    async fn run(
        state: &Arc<AppState>,
        conn_id: u64,
        subscription: &mut Subscription,
        transaction: &mut TransactionState,
        cmd: &str,
        args: &[&str],
    ) -> Vec<Value> {
        let (pub_tx, _pub_rx) = mpsc::channel(8);
        dispatch_command(
            state,
            conn_id,
            subscription,
            transaction,
            cmd.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
            &pub_tx,
        )
        .await
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let state = new_state();
        let mut sub = Subscription::default();
        let mut tx = TransactionState::default();
        let reply = run(&state, 1, &mut sub, &mut tx, "SET", &["foo", "bar"]).await;
        assert_eq!(reply, vec![Value::ok()]);
        let reply = run(&state, 1, &mut sub, &mut tx, "GET", &["foo"]).await;
        assert_eq!(reply, vec![Value::Bulk(b"bar".to_vec())]);
    }

    #[tokio::test]
    async fn unknown_command_is_empty_simple_string() {
        let state = new_state();
        let mut sub = Subscription::default();
        let mut tx = TransactionState::default();
        let reply = run(&state, 1, &mut sub, &mut tx, "FROBNICATE", &[]).await;
        assert_eq!(reply, vec![Value::SimpleString(String::new())]);
    }

    #[tokio::test]
    async fn subscribed_mode_blocks_non_allowlisted_commands() {
        let state = new_state();
        let mut sub = Subscription::default();
        sub.add("ch");
        let mut tx = TransactionState::default();
        let reply = run(&state, 1, &mut sub, &mut tx, "GET", &["foo"]).await;
        let Value::Error(msg) = &reply[0] else { panic!("expected error") };
        assert!(msg.starts_with("ERR Can't execute"));
    }

    #[tokio::test]
    async fn multi_queues_then_exec_runs_in_order() {
        let state = new_state();
        let mut sub = Subscription::default();
        let mut tx = TransactionState::default();
        assert_eq!(run(&state, 1, &mut sub, &mut tx, "MULTI", &[]).await, vec![Value::ok()]);
        assert_eq!(
            run(&state, 1, &mut sub, &mut tx, "SET", &["x", "1"]).await,
            vec![Value::SimpleString("QUEUED".to_string())]
        );
        assert_eq!(
            run(&state, 1, &mut sub, &mut tx, "INCR", &["x"]).await,
            vec![Value::SimpleString("QUEUED".to_string())]
        );
        let reply = run(&state, 1, &mut sub, &mut tx, "EXEC", &[]).await;
        assert_eq!(reply, vec![Value::Array(vec![Value::ok(), Value::Integer(2)])]);

        let reply = run(&state, 1, &mut sub, &mut tx, "GET", &["x"]).await;
        assert_eq!(reply, vec![Value::Bulk(b"2".to_vec())]);
    }

    #[tokio::test]
    async fn exec_without_multi_is_an_error() {
        let state = new_state();
        let mut sub = Subscription::default();
        let mut tx = TransactionState::default();
        let reply = run(&state, 1, &mut sub, &mut tx, "EXEC", &[]).await;
        let Value::Error(msg) = &reply[0] else { panic!("expected error") };
        assert!(msg.contains("EXEC without MULTI"));
    }

    #[tokio::test]
    async fn write_command_propagates_to_registered_replica() {
        let state = new_state();
        let (tx, mut rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        state.replication.register_replica(addr, tx).await;

        let mut sub = Subscription::default();
        let mut transaction = TransactionState::default();
        run(&state, 1, &mut sub, &mut transaction, "SET", &["k", "v"]).await;

        let propagated = rx.recv().await.unwrap();
        assert_eq!(propagated, resp::encode_command(&["SET", "k", "v"]));
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let state = new_state();
        let mut sub_a = Subscription::default();
        let mut tx_a = TransactionState::default();
        let (pub_tx, mut pub_rx) = mpsc::channel(8);
        dispatch_command(&state, 1, &mut sub_a, &mut tx_a, "SUBSCRIBE".to_string(), vec!["ch".to_string()], &pub_tx)
            .await;

        let mut sub_b = Subscription::default();
        let mut tx_b = TransactionState::default();
        let reply = run(&state, 2, &mut sub_b, &mut tx_b, "PUBLISH", &["ch", "hello"]).await;
        assert_eq!(reply, vec![Value::Integer(1)]);

        let msg = pub_rx.recv().await.unwrap();
        assert_eq!(
            msg,
            Value::Array(vec![Value::bulk_str("message"), Value::bulk_str("ch"), Value::bulk_str("hello")])
        );
    }

    #[tokio::test]
    async fn config_get_returns_pair_or_empty_array() {
        let state = new_state();
        state.config.set("dir", "/data").await;
        let mut sub = Subscription::default();
        let mut tx = TransactionState::default();
        let reply = run(&state, 1, &mut sub, &mut tx, "CONFIG", &["GET", "dir"]).await;
        assert_eq!(reply, vec![Value::array_of_bulks(["dir", "/data"])]);
        let reply = run(&state, 1, &mut sub, &mut tx, "CONFIG", &["GET", "missing"]).await;
        assert_eq!(reply, vec![Value::Array(Vec::new())]);
    }
}
