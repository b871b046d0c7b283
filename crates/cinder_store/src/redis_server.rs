//! RESP2 protocol surface: get/set/del/recover plus the liveness and drain
//! commands the proxy uses.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::ops::StoreError;
use crate::persist::PersistentStore;
use crate::{GET_OPTION_OPTIONAL, PONG_RECONCILE, PONG_WITH_PAYLOAD};

/// Produces the lineage short-status attached to object replies. Installed
/// by a lineage-aware layer; absent by default.
pub type PiggybackFn = Box<dyn Fn() -> Option<Bytes> + Send + Sync>;

pub struct WorkerState {
    pub store: Arc<PersistentStore>,
    /// Hold the reply to a `set` until the op persisted.
    pub ack_after_persist: bool,
    pub piggyback: Option<PiggybackFn>,
    drain_tx: watch::Sender<bool>,
}

impl WorkerState {
    pub fn new(
        store: Arc<PersistentStore>,
        ack_after_persist: bool,
        piggyback: Option<PiggybackFn>,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (drain_tx, drain_rx) = watch::channel(false);
        (
            Arc::new(Self {
                store,
                ack_after_persist,
                piggyback,
                drain_tx,
            }),
            drain_rx,
        )
    }

    /// Ask the serve loop to drain and exit.
    pub fn request_drain(&self) {
        let _ = self.drain_tx.send(true);
    }
}

#[derive(Debug)]
enum WorkerCmd {
    Ping,
    Test,
    Data,
    Get {
        req_id: String,
        chunk_id: String,
        key: String,
        size: Option<u64>,
        option: u32,
    },
    Set {
        req_id: String,
        chunk_id: String,
        key: String,
        body: Bytes,
    },
    Del {
        req_id: String,
        chunk_id: String,
        key: String,
    },
    Recover {
        req_id: String,
        chunk_id: String,
        key: String,
        ret_cmd: String,
        size: u64,
    },
}

pub async fn handle_conn(socket: TcpStream, state: Arc<WorkerState>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_command(frame) {
            Ok(Some(cmd)) => dispatch(&state, cmd).await,
            Ok(None) => continue,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.feed(reply).await?;
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut framed).await?;
    }
    Ok(())
}

async fn dispatch(state: &WorkerState, cmd: WorkerCmd) -> BytesFrame {
    match cmd {
        WorkerCmd::Ping => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
        WorkerCmd::Test => BytesFrame::Array(vec![bulk("test")]),
        WorkerCmd::Data => {
            // Drain signal from the proxy: reply first, then let the serve
            // loop stop the tracker and rest.
            state.request_drain();
            BytesFrame::Array(vec![bulk("data"), bulk("OK")])
        }
        WorkerCmd::Get {
            req_id,
            chunk_id,
            key,
            size,
            option,
        } => handle_get(state, req_id, chunk_id, key, size, option).await,
        WorkerCmd::Set {
            req_id,
            chunk_id,
            key,
            body,
        } => handle_set(state, req_id, chunk_id, key, body).await,
        WorkerCmd::Del {
            req_id,
            chunk_id,
            key,
        } => handle_del(state, req_id, chunk_id, key).await,
        WorkerCmd::Recover {
            req_id,
            chunk_id,
            key,
            ret_cmd,
            size,
        } => handle_recover(state, req_id, chunk_id, key, ret_cmd, size).await,
    }
}

async fn handle_get(
    state: &WorkerState,
    req_id: String,
    chunk_id: String,
    key: String,
    size: Option<u64>,
    option: u32,
) -> BytesFrame {
    let mut recovered = 0i64;
    let mut result = state.store.get(&key).await;

    // Missing locally: recover from the blob tier unless the proxy marked
    // the read optional. Deleted chunks are never recovered.
    if matches!(
        result,
        Err(StoreError::NotFound) | Err(StoreError::Incomplete)
    ) && state.store.recovery_enabled()
    {
        tracing::debug!(key = %key, req_id = %req_id, "key not found locally, trying recovery");
        if option & GET_OPTION_OPTIONAL != 0 {
            let err = result.err().unwrap_or(StoreError::NotFound);
            return error_frame(500, &format!("failed to get {key}: {err}"));
        }
        let Some(size) = size else {
            return error_frame(
                500,
                "size must be set for trying recovery from persistent layer",
            );
        };
        if let Err(err) = state.store.set_recovery(&key, &chunk_id, size, option).await {
            return error_frame(500, &format!("failed to recover {key}: {err}"));
        }
        recovered = 1;
        result = state.store.get(&key).await;
    }

    match result {
        Ok((chunk_id, body)) => {
            object_frame(state, "get", &req_id, &chunk_id, Some(recovered), Some(body))
        }
        Err(StoreError::NotFound) => error_frame(404, &format!("key not found {key}")),
        Err(err) => error_frame(500, &format!("failed to get {key}: {err}")),
    }
}

async fn handle_set(
    state: &WorkerState,
    req_id: String,
    chunk_id: String,
    key: String,
    body: Bytes,
) -> BytesFrame {
    match state.store.set(&key, &chunk_id, body).await {
        Ok(ret) => {
            if state.ack_after_persist {
                if let Err(err) = ret.wait().await {
                    return error_frame(500, &format!("failed to persist {key}: {err}"));
                }
            }
            object_frame(state, "set", &req_id, &chunk_id, None, None)
        }
        Err(err) => error_frame(500, &format!("failed to set {key}: {err}")),
    }
}

async fn handle_del(
    state: &WorkerState,
    req_id: String,
    chunk_id: String,
    key: String,
) -> BytesFrame {
    match state.store.del(&key, "request").await {
        Ok(_) => object_frame(state, "del", &req_id, &chunk_id, None, None),
        Err(StoreError::NotFound) => error_frame(404, &format!("failed to del {key}: key not found")),
        Err(err) => error_frame(500, &format!("failed to del {key}: {err}")),
    }
}

async fn handle_recover(
    state: &WorkerState,
    req_id: String,
    chunk_id: String,
    key: String,
    ret_cmd: String,
    size: u64,
) -> BytesFrame {
    if !state.store.recovery_enabled() {
        return error_frame(500, "recover is not supported");
    }
    if let Err(err) = state.store.set_recovery(&key, &chunk_id, size, 0).await {
        return error_frame(500, &format!("failed to recover {key}: {err}"));
    }
    tracing::debug!(key = %key, chunk_id = %chunk_id, "recovered from persistent store");

    if ret_cmd.eq_ignore_ascii_case("get") {
        match state.store.get(&key).await {
            Ok((chunk_id, body)) => {
                object_frame(state, &ret_cmd, &req_id, &chunk_id, Some(1), Some(body))
            }
            Err(err) => error_frame(500, &format!("failed to get {key}: {err}")),
        }
    } else {
        object_frame(state, &ret_cmd, &req_id, &chunk_id, Some(1), None)
    }
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<WorkerCmd>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }

    let cmd = frame_str_upper(&parts[0]).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    match cmd.as_str() {
        "PING" => Ok(Some(WorkerCmd::Ping)),
        "TEST" => Ok(Some(WorkerCmd::Test)),
        "DATA" => Ok(Some(WorkerCmd::Data)),
        "GET" => {
            anyhow::ensure!(parts.len() >= 4, "GET expects at least 3 arguments");
            Ok(Some(WorkerCmd::Get {
                req_id: arg_str(&parts, 1)?,
                chunk_id: arg_str(&parts, 2)?,
                key: arg_str(&parts, 3)?,
                size: opt_arg_u64(&parts, 4)?,
                option: opt_arg_u64(&parts, 5)?.unwrap_or(0) as u32,
            }))
        }
        "SET" => {
            anyhow::ensure!(parts.len() == 5, "SET expects 4 arguments");
            Ok(Some(WorkerCmd::Set {
                req_id: arg_str(&parts, 1)?,
                chunk_id: arg_str(&parts, 2)?,
                key: arg_str(&parts, 3)?,
                body: frame_bytes(&parts[4])
                    .ok_or_else(|| anyhow::anyhow!("invalid body"))?,
            }))
        }
        "DEL" => {
            anyhow::ensure!(parts.len() == 4, "DEL expects 3 arguments");
            Ok(Some(WorkerCmd::Del {
                req_id: arg_str(&parts, 1)?,
                chunk_id: arg_str(&parts, 2)?,
                key: arg_str(&parts, 3)?,
            }))
        }
        "RECOVER" => {
            anyhow::ensure!(parts.len() == 6, "RECOVER expects 5 arguments");
            let size = opt_arg_u64(&parts, 5)?
                .ok_or_else(|| anyhow::anyhow!("size must be set"))?;
            Ok(Some(WorkerCmd::Recover {
                req_id: arg_str(&parts, 1)?,
                chunk_id: arg_str(&parts, 2)?,
                key: arg_str(&parts, 3)?,
                ret_cmd: arg_str(&parts, 4)?.to_ascii_lowercase(),
                size,
            }))
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn object_frame(
    state: &WorkerState,
    cmd: &str,
    req_id: &str,
    chunk_id: &str,
    recovered: Option<i64>,
    body: Option<Bytes>,
) -> BytesFrame {
    let mut parts = vec![bulk(cmd), bulk(req_id), bulk(chunk_id)];
    if let Some(recovered) = recovered {
        parts.push(BytesFrame::Integer(recovered));
    }
    if let Some(body) = body {
        parts.push(BytesFrame::BulkString(body));
    }
    if let Some(piggyback) = &state.piggyback {
        if let Some(payload) = piggyback() {
            parts.push(BytesFrame::Integer(
                i64::from(PONG_WITH_PAYLOAD | PONG_RECONCILE),
            ));
            parts.push(BytesFrame::BulkString(payload));
        }
    }
    BytesFrame::Array(parts)
}

fn error_frame(status: u16, msg: &str) -> BytesFrame {
    BytesFrame::Error(format!("{status} {msg}").into())
}

fn bulk(s: &str) -> BytesFrame {
    BytesFrame::BulkString(Bytes::from(s.to_string()))
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn frame_bytes(frame: &BytesFrame) -> Option<Bytes> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.clone()),
        _ => None,
    }
}

fn arg_str(parts: &[BytesFrame], idx: usize) -> anyhow::Result<String> {
    parts
        .get(idx)
        .and_then(|frame| frame.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("invalid argument {idx}"))
}

fn opt_arg_u64(parts: &[BytesFrame], idx: usize) -> anyhow::Result<Option<u64>> {
    let Some(frame) = parts.get(idx) else {
        return Ok(None);
    };
    let text = frame
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("invalid argument {idx}"))?;
    let value = text
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("invalid number {text:?}"))?;
    Ok(Some(value))
}
