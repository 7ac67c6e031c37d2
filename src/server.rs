//! Unix-socket agent server.
//!
//! Each connection gets its own thread and carries a sequence of
//! length-prefixed JSON requests, each answered with one [`CommandResult`].
//! A separate watcher thread probes the hypervisor connection and runs the
//! disconnect hooks when it drops.

use crate::agent::{AgentContext, Dispatcher};
use crate::error::{Error, Result};
use hostagent_protocol::{read_frame, read_message, write_message, AgentRequest, CommandResult, DecodeError};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Bind the control socket, replacing a stale socket file.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!(socket = %path.display(), "listening");
    Ok(listener)
}

/// Accept connections forever, one thread each.
pub fn serve(listener: UnixListener, ctx: Arc<AgentContext>, dispatcher: Arc<Dispatcher>) -> Result<()> {
    for (conn_id, stream) in listener.incoming().enumerate() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
                continue;
            }
        };
        let ctx = ctx.clone();
        let dispatcher = dispatcher.clone();
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", conn_id))
            .spawn(move || {
                tracing::debug!(conn = conn_id, "accepted connection");
                if let Err(e) = handle_connection(&mut stream, &ctx, &dispatcher) {
                    tracing::warn!(conn = conn_id, error = %e, "connection error");
                }
                tracing::debug!(conn = conn_id, "connection closed");
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn connection thread");
        }
    }
    Ok(())
}

/// Serve requests on one stream until the peer closes it.
///
/// Frames that do not decode as a request are answered with a failed
/// result; an oversized frame ends the connection since the stream can no
/// longer be resynchronised.
pub fn handle_connection<S: Read + Write>(
    stream: &mut S,
    ctx: &AgentContext,
    dispatcher: &Dispatcher,
) -> Result<()> {
    loop {
        let frame = match read_frame(stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(DecodeError::FrameTooLarge(len)) => {
                write_message(
                    stream,
                    &CommandResult::failure(format!("frame of {} bytes exceeds limit", len)),
                )?;
                return Err(DecodeError::FrameTooLarge(len).into());
            }
            Err(e) => return Err(e.into()),
        };

        let result = match serde_json::from_slice::<AgentRequest>(&frame) {
            Ok(request) => dispatcher.execute(ctx, request),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable request");
                CommandResult::failure(format!("invalid request: {}", e))
            }
        };
        match write_message(stream, &result) {
            Err(DecodeError::FrameTooLarge(len)) => {
                tracing::warn!(bytes = len, "result exceeds frame limit");
                write_message(
                    stream,
                    &CommandResult::failure(format!("result of {} bytes exceeds frame limit", len)),
                )?;
            }
            other => other?,
        }
    }
}

/// Send one request to a running agent and wait for its result.
pub fn send_request(socket: &Path, request: &AgentRequest) -> Result<CommandResult> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|e| Error::config(format!("cannot connect to {}: {}", socket.display(), e)))?;
    write_message(&mut stream, request)?;
    read_message(&mut stream)?
        .ok_or_else(|| Error::hypervisor("agent closed the connection without replying"))
}

/// Background hypervisor connection probe.
pub struct ConnectionWatcher {
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionWatcher {
    pub fn spawn(ctx: Arc<AgentContext>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("conn-watcher".into())
            .spawn(move || {
                let mut healthy = true;
                loop {
                    probe_connection(&ctx, &mut healthy);
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One probe. Disconnect hooks run on the first failure after a healthy
/// probe; capabilities are refreshed when the connection comes back.
pub fn probe_connection(ctx: &AgentContext, healthy: &mut bool) {
    match ctx.hypervisor().versions() {
        Ok(_) if !*healthy => {
            tracing::info!("hypervisor connection restored");
            if let Err(e) = ctx.refresh_capabilities() {
                tracing::warn!(error = %e, "failed to refresh capabilities");
            }
            *healthy = true;
        }
        Ok(_) => {}
        Err(e) if *healthy => {
            tracing::warn!(error = %e, "hypervisor connection lost");
            *healthy = false;
            let report = ctx.hooks().on_disconnect();
            if !report.abandoned.is_empty() || !report.failed.is_empty() {
                tracing::warn!(
                    abandoned = ?report.abandoned,
                    failed = ?report.failed,
                    "disconnect cleanup incomplete"
                );
            }
        }
        Err(e) => tracing::debug!(error = %e, "hypervisor still unreachable"),
    }
}
