//! Process group wiring for the `portshare` binary.

use std::os::fd::AsRawFd;

use anyhow::{anyhow, Context, Result};
use portshare_broker::binder;
use portshare_broker::{
    Config, Coordinator, Listening, PrimaryCoordinator, WorkerCoordinator, WorkerSession,
};
use portshare_id::WorkerId;
use portshare_ipc::{unix, PrimaryMessage, WorkerMessage};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// Environment variable naming a worker's id, set by the primary.
const WORKER_ID_ENV: &str = "PORTSHARE_WORKER_ID";

pub async fn run_primary(config: Config) -> Result<()> {
    info!(
        workers = config.workers,
        proxy_port = ?config.options.proxy_port,
        port_range = ?config.options.port_range.map(|r| r.to_string()),
        "Starting portshare primary"
    );

    let binder = binder::from_options(&config.options)
        .await
        .context("Failed to set up binder")?;
    let coordinator = PrimaryCoordinator::new(binder);

    let (sessions_tx, sessions_rx) = mpsc::channel(config.workers.max(1));
    tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run(sessions_rx).await }
    });

    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    let mut children = JoinSet::new();
    let mut worker_id = WorkerId::new(1);

    for _ in 0..config.workers {
        let (primary_end, worker_end) = unix::socketpair_seqpacket()?;
        unix::make_inheritable(&worker_end)?;

        let child = Command::new(&exe)
            .env(unix::CHANNEL_FD_ENV, worker_end.as_raw_fd().to_string())
            .env("PORTSHARE_ROLE", "worker")
            .env(WORKER_ID_ENV, worker_id.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker {}", worker_id))?;
        // The child holds its own copy now.
        drop(worker_end);

        info!(worker = %worker_id, pid = ?child.id(), "Worker spawned");

        let endpoint = unix::endpoint(primary_end)?;
        sessions_tx
            .send(WorkerSession {
                worker_id,
                endpoint,
            })
            .await
            .map_err(|_| anyhow!("Coordinator stopped before worker {} connected", worker_id))?;

        children.spawn(wait_child(worker_id, child));
        worker_id = worker_id.next();
    }
    drop(sessions_tx);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping workers");
        }
        _ = async { while children.join_next().await.is_some() {} } => {
            warn!("All workers exited");
        }
    }
    Ok(())
}

async fn wait_child(worker_id: WorkerId, mut child: Child) {
    match child.wait().await {
        Ok(status) if status.success() => info!(worker = %worker_id, "Worker exited"),
        Ok(status) => warn!(worker = %worker_id, %status, "Worker exited abnormally"),
        Err(e) => error!(worker = %worker_id, error = %e, "Failed to wait for worker"),
    }
}

pub async fn run_worker(config: Config) -> Result<()> {
    let worker_id: Option<WorkerId> = std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse().ok());
    let span = tracing::info_span!("worker", worker = ?worker_id.map(|w| w.to_string()));

    async move {
        let channel = unix::inherited_from_env()?.with_context(|| {
            format!(
                "{} not set; workers are started by the primary",
                unix::CHANNEL_FD_ENV
            )
        })?;
        let (link, inbound) = unix::endpoint::<WorkerMessage, PrimaryMessage>(channel)?.split();

        let worker = WorkerCoordinator::new(link, config.options.request_timeout);
        let pump = worker.spawn(inbound);
        let coordinator = Coordinator::from(worker);

        let mut servers = JoinSet::new();
        for &port in &config.worker_ports {
            match coordinator.listen(port, &config.worker_host).await {
                Ok(listening) => {
                    info!(
                        requested = port,
                        addr = %listening.local_addr(),
                        "Listening"
                    );
                    servers.spawn(serve_echo(listening));
                }
                Err(e) => {
                    error!(requested = port, code = e.reason_code(), error = %e, "Listen failed");
                }
            }
        }

        // Runs until the primary goes away.
        pump.await.context("Message pump failed")?;
        info!("Primary channel closed, exiting");
        servers.abort_all();
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

async fn serve_echo(listening: Listening) {
    match listening {
        Listening::Direct(socket) => {
            let listener = match socket.into_tokio() {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, "Failed to register listener");
                    return;
                }
            };
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(echo(stream).instrument(tracing::debug_span!("echo", %peer)));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
        Listening::Virtual(mut handle) => {
            while let Some(connection) = handle.accept().await {
                let peer = connection.peer;
                tokio::spawn(
                    echo(connection.stream).instrument(tracing::debug_span!("echo", %peer)),
                );
            }
        }
    }
}

async fn echo(mut stream: TcpStream) {
    let (mut reader, mut writer) = stream.split();
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(bytes, "Connection closed"),
        Err(e) => debug!(error = %e, "Connection error"),
    }
    let _ = writer.shutdown().await;
}
