mod config;
mod dispatcher;
mod entry;
mod error;
mod keyspace;
mod pubsub;
mod rdb;
mod replication;
mod resp;
mod transactions;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use config::Config;
use dispatcher::AppState;
use keyspace::Keyspace;
use pubsub::PubSub;
use replication::ReplicationState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = config::parse_args(std::env::args().skip(1)).map_err(|e| anyhow::anyhow!(e))?;

    let config = Config::new();
    config.set("port", opts.port.to_string()).await;
    if let Some(dir) = &opts.dir {
        config.set("dir", dir.clone()).await;
    }
    if let Some(dbfilename) = &opts.dbfilename {
        config.set("dbfilename", dbfilename.clone()).await;
    }

    let keyspace = Keyspace::new();
    let replication = ReplicationState::new();
    let pubsub = PubSub::new();

    if let Some(path) = opts.rdb_path() {
        match tokio::fs::File::open(&path).await {
            Ok(mut file) => match rdb::load(&mut file, &keyspace).await {
                Ok(()) => tracing::info!(%path, "loaded RDB seed snapshot"),
                Err(e) => tracing::warn!(%path, error = %e, "failed to parse RDB seed snapshot; starting empty"),
            },
            Err(e) => tracing::info!(%path, error = %e, "no RDB seed snapshot found"),
        }
    }

    let state = Arc::new(AppState { keyspace, config, replication, pubsub });

    if let Some((host, port)) = opts.replica_of.clone() {
        let replica_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher::run_replica_link(replica_state, host.clone(), port).await {
                tracing::error!(%host, port, error = %e, "replica link to primary ended");
            }
        });
    }

    let listener = TcpListener::bind(("127.0.0.1", opts.port))
        .await
        .with_context(|| format!("failed to bind to port {}", opts.port))?;
    tracing::info!(port = opts.port, "listening");

    let next_conn_id = Arc::new(AtomicU64::new(1));
    loop {
        let (stream, addr) = listener.accept().await.context("failed to accept connection")?;
        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_state = state.clone();
        tracing::info!(conn_id, %addr, "connection accepted");
        tokio::spawn(async move {
            dispatcher::handle_connection(conn_state, stream, addr, conn_id).await;
        });
    }
}
