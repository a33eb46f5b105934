//! Control-socket request server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::format_duration;
use crate::error::{io_err, DaemonError};
use crate::processor::{SyncHandle, SyncOp};
use crate::protocol::{Request, RequestDecoder, Response, MAX_REQUEST_BYTES};

/// Accept errors in a row after which the listener is considered broken.
pub(crate) const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 16;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 8 * 1024;

pub(crate) struct ServerContext {
    pub(crate) sync: SyncHandle,
    pub(crate) pid: u32,
    pub(crate) interval: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) connections: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
}

/// Accept connections until shutdown, one handler task per client.
///
/// Returns once the listener has been dropped. Repeated accept failures
/// trigger shutdown.
pub(crate) async fn accept_loop(
    listener: UnixListener,
    ctx: Arc<ServerContext>,
) -> Result<(), DaemonError> {
    let mut consecutive_errors = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    consecutive_errors = 0;
                    match ctx.connections.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(err) = handle_client(stream, &ctx).await {
                                    tracing::warn!(error = %err, "socket client error");
                                }
                            });
                        }
                        Err(_) => {
                            tracing::warn!("connection limit reached, rejecting client");
                            tokio::spawn(reject(stream));
                        }
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    tracing::error!(error = %err, consecutive = consecutive_errors, "accept failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                        tracing::error!("listener keeps failing, shutting down");
                        ctx.shutdown.cancel();
                        break;
                    }
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    Ok(())
}

async fn reject(stream: UnixStream) {
    let (_, mut writer) = stream.into_split();
    let response = Response::error(0, "too many connections");
    if let Err(err) = write_response(&mut writer, &response).await {
        tracing::debug!(error = %err, "failed to notify rejected client");
    }
}

async fn handle_client(stream: UnixStream, ctx: &ServerContext) -> Result<(), DaemonError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = RequestDecoder::default();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        loop {
            match decoder.next_request() {
                Ok(Some(request)) => {
                    let response = dispatch(&request, ctx).await;
                    write_response(&mut writer, &response).await?;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed request, closing connection");
                    return Ok(());
                }
            }
        }
        if decoder.is_oversized() {
            tracing::warn!(limit = MAX_REQUEST_BYTES, "request too large, closing connection");
            return Ok(());
        }

        let read = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            read = tokio::time::timeout(ctx.idle_timeout, reader.read(&mut chunk)) => read,
        };
        match read {
            Err(_) => {
                tracing::debug!("closing idle connection");
                return Ok(());
            }
            Ok(Ok(0)) => {
                if decoder.has_partial() {
                    tracing::debug!("client disconnected mid-request");
                }
                return Ok(());
            }
            Ok(Ok(n)) => decoder.extend(&chunk[..n]),
            Ok(Err(err)) => return Err(io_err("daemon socket read", err)),
        }
    }
}

async fn dispatch(request: &Request, ctx: &ServerContext) -> Response {
    let id = request.id;
    match request.method.as_str() {
        "ping" => Response::ok(id, json!("pong")),
        "sync" => match ctx.sync.run(SyncOp::Export).await {
            Ok(_) => Response::ok(id, json!("synced")),
            Err(err) => Response::error(id, err.to_string()),
        },
        "import" => match ctx.sync.run(SyncOp::Import).await {
            Ok(_) => Response::ok(id, json!("imported")),
            Err(err) => Response::error(id, err.to_string()),
        },
        "status" => Response::ok(id, status_payload(ctx)),
        other => Response::error(id, format!("unknown method: {other}")),
    }
}

fn status_payload(ctx: &ServerContext) -> Value {
    json!({
        "running": true,
        "pid": ctx.pid,
        "interval": format_duration(ctx.interval),
    })
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &Response,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}
