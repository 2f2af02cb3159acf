//! Master/worker task hand-off over TCP.
//!
//! The protocol is newline-delimited: a worker writes `PULL`, the master
//! answers with one task encoded as a line of JSON. A worker only asks for
//! another task once the previous one has been accepted into its local jar,
//! so the local jar's capacity is what throttles it.
//!
//! The next `PULL` also acknowledges the previous task. When a connection
//! ends, the master puts the one task it delivered but never saw
//! acknowledged back into its jar, so a worker that dies mid hand-off can
//! cause that task to run twice but never to be lost.

use exn::ResultExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::jar::TaskJar;
use crate::task::Task;

const PULL: &str = "PULL";

/// Serve tasks from `jar` to every worker that connects to `listener`, until
/// `token` is cancelled.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve(listener: TcpListener, jar: TaskJar, token: CancellationToken) -> Result<()> {
    let connected = Arc::new(AtomicUsize::new(0));
    let mut workers = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept worker connection");
                    continue;
                },
            },
        };
        tracing::info!(%peer, "worker connected");
        workers.spawn(handle_worker(stream, peer, jar.clone(), Arc::clone(&connected), token.clone()));
        // Reap finished connections as we go.
        while workers.try_join_next().is_some() {}
    }
    workers.shutdown().await;
    Ok(())
}

async fn handle_worker(
    stream: TcpStream,
    peer: SocketAddr,
    jar: TaskJar,
    connected: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    connected.fetch_add(1, Ordering::Relaxed);
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut unacked: Option<Task> = None;
    loop {
        let line = tokio::select! {
            () = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim() == PULL => {
                if let Some(task) = unacked.take() {
                    tracing::trace!(%peer, task = task.id, "worker acknowledged task");
                }
            },
            Ok(Some(line)) => {
                tracing::warn!(%peer, line = %line, "unexpected message from worker");
                continue;
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "worker connection failed");
                break;
            },
        }

        // Keep watching the socket while waiting, or a worker that goes away
        // meanwhile would be handed the next task.
        let task = tokio::select! {
            () = token.cancelled() => break,
            () = closed(&mut lines, peer) => break,
            task = jar.send(connected.load(Ordering::Relaxed)) => task,
        };
        let task = match task {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(error = ?err, "task jar unavailable");
                break;
            },
        };
        if let Err(err) = write_task(&mut write, &task).await {
            tracing::warn!(%peer, task = task.id, error = ?err, "could not deliver task");
            requeue(&jar, task).await;
            break;
        }
        unacked = Some(task);
    }
    if let Some(task) = unacked {
        tracing::warn!(%peer, task = task.id, "worker left without acknowledging task");
        requeue(&jar, task).await;
    }
    connected.fetch_sub(1, Ordering::Relaxed);
    tracing::info!(%peer, "worker disconnected");
}

/// Resolves once the worker has closed its side of the connection. Nothing
/// but `PULL` is expected, and only after a task was written, so any line
/// read here is out of turn and ignored.
async fn closed<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>, peer: SocketAddr) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::warn!(%peer, line = %line, "unexpected message from waiting worker"),
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "worker connection failed");
                return;
            },
        }
    }
}

async fn requeue(jar: &TaskJar, task: Task) {
    let id = task.id;
    match jar.receive(task).await {
        Ok(()) => tracing::info!(task = id, "requeued task"),
        Err(err) => tracing::error!(task = id, error = ?err, "lost task while requeueing"),
    }
}

async fn write_task(write: &mut (impl AsyncWrite + Unpin), task: &Task) -> Result<()> {
    let mut line = task.to_line()?;
    line.push('\n');
    write.write_all(line.as_bytes()).await.or_raise(|| ErrorKind::Io)?;
    write.flush().await.or_raise(|| ErrorKind::Io)?;
    Ok(())
}

/// Pull tasks from the master at `addr` into `jar` until `token` is
/// cancelled or the master goes away.
#[instrument(skip_all)]
pub async fn fetch(addr: impl ToSocketAddrs + std::fmt::Display, jar: TaskJar, token: CancellationToken) -> Result<()> {
    let stream = TcpStream::connect(&addr)
        .await
        .or_raise(|| ErrorKind::Connect(addr.to_string()))?;
    tracing::info!(master = %addr, "connected to master");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        write
            .write_all(format!("{PULL}\n").as_bytes())
            .await
            .or_raise(|| ErrorKind::Disconnected)?;
        let line = tokio::select! {
            () = token.cancelled() => return Ok(()),
            line = lines.next_line() => line.or_raise(|| ErrorKind::Disconnected)?,
        };
        let Some(line) = line else {
            exn::bail!(ErrorKind::Disconnected);
        };
        let task = Task::from_line(&line)?;
        let id = task.id;
        tokio::select! {
            () = token.cancelled() => {
                tracing::warn!(task = id, "shutting down before accepting task, master will requeue it");
                return Ok(());
            },
            received = jar.receive(task) => received?,
        }
    }
}
