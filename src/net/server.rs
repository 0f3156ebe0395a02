//! Inbound side of the shared listener: consensus RPC framing on one tag,
//! snapshot installation streams on the other.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use prost::Message;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::net::stream_layer::{Connection, StreamLayer, STREAM_TAG};
use crate::net::{
    read_frame, write_frame, OP_APPEND_ENTRIES, OP_JOIN, OP_LEAVE, OP_REQUEST_VOTE, STATUS_ERR,
    STATUS_OK,
};
use crate::raft::event_loop::LeaderContact;
use crate::raft::node::RaftNode;
use crate::raft::rpc::{
    Ack, AppendEntriesRequest, JoinRequest, LeaveRequest, RequestVoteRequest, SnapshotHeader,
};

/// Largest snapshot stream accepted from a peer.
const MAX_SNAPSHOT_LEN: u64 = 1024 * 1024 * 1024;

/// Accept loop over the stream layer. Each connection runs in its own
/// task; handlers touch disk, so the node lock is taken on the blocking
/// pool.
pub struct RaftServer {
    node: Arc<Mutex<RaftNode>>,
    layer: StreamLayer,
    contact: LeaderContact,
}

impl RaftServer {
    pub fn new(node: Arc<Mutex<RaftNode>>, layer: StreamLayer, contact: LeaderContact) -> Self {
        RaftServer {
            node,
            layer,
            contact,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                accepted = self.layer.accept() => {
                    match accepted {
                        Ok((conn, tag)) => {
                            let node = Arc::clone(&self.node);
                            let contact = self.contact.clone();
                            tokio::spawn(async move {
                                let result = if tag == STREAM_TAG {
                                    handle_snapshot_stream(node, contact, conn).await
                                } else {
                                    handle_rpc_connection(node, contact, conn).await
                                };
                                if let Err(err) = result {
                                    debug!("connection ended: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

/// Frame loop for a consensus connection: `opcode | len | payload` in,
/// `status | len | payload` out, until the peer hangs up.
async fn handle_rpc_connection(
    node: Arc<Mutex<RaftNode>>,
    contact: LeaderContact,
    mut conn: Connection,
) -> Result<()> {
    loop {
        let (opcode, payload) = match read_frame(&mut conn).await {
            Ok(frame) => frame,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let handler_node = Arc::clone(&node);
        let handler_contact = contact.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            dispatch(&handler_node, &handler_contact, opcode, &payload)
        })
        .await
        .map_err(|_| Error::Protocol("request handler task failed".to_string()))?;

        match outcome {
            Ok(response) => write_frame(&mut conn, STATUS_OK, &response).await?,
            Err(err) => {
                write_frame(&mut conn, STATUS_ERR, err.to_string().as_bytes()).await?;
            }
        }
    }
}

fn dispatch(
    node: &Mutex<RaftNode>,
    contact: &LeaderContact,
    opcode: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    match opcode {
        OP_REQUEST_VOTE => {
            let request = RequestVoteRequest::decode(payload)?;
            let response = node.lock().handle_request_vote(request)?;
            if response.vote_granted {
                contact.reset();
            }
            Ok(response.encode_to_vec())
        }
        OP_APPEND_ENTRIES => {
            let request = AppendEntriesRequest::decode(payload)?;
            let response = node.lock().handle_append_entries(request)?;
            if response.success {
                contact.reset();
            }
            Ok(response.encode_to_vec())
        }
        OP_JOIN => {
            let request = JoinRequest::decode(payload)?;
            node.lock().add_voter(&request.id, &request.addr)?;
            Ok(Ack {}.encode_to_vec())
        }
        OP_LEAVE => {
            let request = LeaveRequest::decode(payload)?;
            node.lock().remove_server(&request.id)?;
            Ok(Ack {}.encode_to_vec())
        }
        other => Err(Error::Protocol(format!("unknown opcode {other}"))),
    }
}

/// Receives one snapshot: a header frame, then the length-prefixed record
/// stream, answered with a status frame.
async fn handle_snapshot_stream(
    node: Arc<Mutex<RaftNode>>,
    contact: LeaderContact,
    mut conn: Connection,
) -> Result<()> {
    let (_, header_bytes) = read_frame(&mut conn).await?;
    let header = SnapshotHeader::decode(header_bytes.as_slice())?;

    let len = conn.read_u64().await?;
    if len > MAX_SNAPSHOT_LEN {
        let message = format!("snapshot of {len} bytes exceeds limit");
        write_frame(&mut conn, STATUS_ERR, message.as_bytes()).await?;
        return Err(Error::Protocol(message));
    }
    let mut stream = Vec::with_capacity(8 + len as usize);
    stream.extend_from_slice(&len.to_be_bytes());
    stream.resize(8 + len as usize, 0);
    conn.read_exact(&mut stream[8..]).await?;

    let outcome = tokio::task::spawn_blocking(move || {
        node.lock().install_snapshot(&header, &stream)
    })
    .await
    .map_err(|_| Error::Protocol("snapshot handler task failed".to_string()))?;

    match outcome {
        Ok(_) => {
            contact.reset();
            write_frame(&mut conn, STATUS_OK, &[]).await
        }
        Err(err) => {
            write_frame(&mut conn, STATUS_ERR, err.to_string().as_bytes()).await?;
            Err(err)
        }
    }
}
