//! Shared helpers for integration tests.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use cinder_store::blob::{BlobCodec, BlobStore, MemBlobStore};
use cinder_store::{start_embedded_worker, WorkerHandle, WorkerOptions};

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Start an embedded worker, optionally backed by a blob store.
pub async fn start_worker(blob: Option<Arc<dyn BlobStore>>) -> (WorkerHandle, SocketAddr) {
    let port = pick_free_port().expect("bind ephemeral port");
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
    let mut opts = WorkerOptions::new(addr);
    opts.worker_id = 1;
    opts.blob = blob;
    let handle = start_embedded_worker(opts).await.expect("start worker");
    (handle, addr)
}

/// Seed a chunk into the blob tier under the worker's default layout.
pub fn seed_chunk(blob: &MemBlobStore, key: &str, body: &'static str) {
    let codec = BlobCodec::new("cinder.backup%s", "", 1);
    blob.insert(
        codec.resolve_bucket(""),
        &codec.blob_key(key),
        Bytes::from_static(body.as_bytes()),
    );
}

/// RESP2 connection speaking the same codec as the worker.
pub struct RespClient {
    framed: Framed<TcpStream, Resp2>,
}

impl RespClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect worker");
        Self {
            framed: Framed::new(stream, Resp2::default()),
        }
    }

    /// Send one command as an array of bulk strings and return the reply.
    pub async fn command(&mut self, parts: &[&str]) -> BytesFrame {
        let frame = BytesFrame::Array(
            parts
                .iter()
                .map(|p| BytesFrame::BulkString(Bytes::copy_from_slice(p.as_bytes())))
                .collect(),
        );
        self.framed.send(frame).await.expect("send command");
        self.framed
            .next()
            .await
            .expect("reply frame")
            .expect("decode reply")
    }
}

pub fn expect_array(frame: BytesFrame) -> Vec<BytesFrame> {
    match frame {
        BytesFrame::Array(parts) => parts,
        other => panic!("expected array reply, got {other:?}"),
    }
}

pub fn expect_error(frame: BytesFrame) -> String {
    match frame {
        BytesFrame::Error(msg) => msg.to_string(),
        other => panic!("expected error reply, got {other:?}"),
    }
}

pub fn frame_text(frame: &BytesFrame) -> String {
    frame.as_str().expect("text frame").to_string()
}

pub fn frame_int(frame: &BytesFrame) -> i64 {
    match frame {
        BytesFrame::Integer(n) => *n,
        other => panic!("expected integer frame, got {other:?}"),
    }
}

pub fn frame_body(frame: &BytesFrame) -> Bytes {
    match frame {
        BytesFrame::BulkString(b) => b.clone(),
        other => panic!("expected bulk string frame, got {other:?}"),
    }
}
