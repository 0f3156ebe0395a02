//! Outbound consensus connections with per-peer pooling.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use prost::Message;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::net::stream_layer::{Connection, StreamLayer, CONSENSUS_TAG};
use crate::net::{read_frame, write_frame, OP_APPEND_ENTRIES, OP_JOIN, OP_LEAVE, OP_REQUEST_VOTE, STATUS_OK};
use crate::raft::rpc::{
    Ack, AppendEntriesRequest, AppendEntriesResponse, JoinRequest, LeaveRequest,
    RequestVoteRequest, RequestVoteResponse,
};

/// Client with persistent connections to the other replicas. One request
/// is in flight per peer connection at a time; a failed connection is
/// dropped from the pool and redialed on the next call.
#[derive(Clone)]
pub struct RaftClient {
    layer: StreamLayer,
    connections: Arc<Mutex<HashMap<String, Arc<Mutex<Connection>>>>>,
}

impl RaftClient {
    pub fn new(layer: StreamLayer) -> Self {
        RaftClient {
            layer,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn request_vote(
        &self,
        addr: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(addr, OP_REQUEST_VOTE, request).await
    }

    pub async fn append_entries(
        &self,
        addr: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(addr, OP_APPEND_ENTRIES, request).await
    }

    /// Asks the replica at `addr` (ideally the leader) to add a voter.
    pub async fn join(&self, addr: &str, id: &str, rpc_addr: &str) -> Result<()> {
        let request = JoinRequest {
            id: id.to_string(),
            addr: rpc_addr.to_string(),
        };
        let _: Ack = self.call(addr, OP_JOIN, request).await?;
        Ok(())
    }

    /// Asks the replica at `addr` to remove a voter.
    pub async fn leave(&self, addr: &str, id: &str) -> Result<()> {
        let request = LeaveRequest { id: id.to_string() };
        let _: Ack = self.call(addr, OP_LEAVE, request).await?;
        Ok(())
    }

    /// Drops every pooled connection.
    pub async fn close(&self) {
        self.connections.lock().await.clear();
    }

    async fn call<Req, Resp>(&self, addr: &str, opcode: u8, request: Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let conn = self.connection(addr).await?;
        let mut guard = conn.lock().await;
        match self.exchange(&mut guard, opcode, &request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                // The stream may be mid-frame; never reuse it.
                drop(guard);
                self.connections.lock().await.remove(addr);
                debug!("dropped connection to {addr}: {err}");
                Err(err)
            }
        }
    }

    async fn exchange<Req, Resp>(
        &self,
        conn: &mut Connection,
        opcode: u8,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        write_frame(conn, opcode, &request.encode_to_vec()).await?;
        let (status, payload) = read_frame(conn).await?;
        if status != STATUS_OK {
            return Err(Error::Protocol(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }
        Ok(Resp::decode(payload.as_slice())?)
    }

    async fn connection(&self, addr: &str) -> Result<Arc<Mutex<Connection>>> {
        if let Some(conn) = self.connections.lock().await.get(addr) {
            return Ok(Arc::clone(conn));
        }
        // Dial outside the pool lock so one slow peer does not stall calls
        // to the others.
        let conn = Arc::new(Mutex::new(self.layer.dial(addr, CONSENSUS_TAG).await?));
        let mut pool = self.connections.lock().await;
        let entry = pool.entry(addr.to_string()).or_insert(conn);
        Ok(Arc::clone(entry))
    }
}
