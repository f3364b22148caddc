//! Wire framing and message types. Every TLS/TCP message is a length-prefixed
//! frame followed by a `bincode`-serialized body; `Connection` below wraps
//! that the same way this codebase wraps its other length-delimited socket
//! streams. Application-level job payloads travel as opaque byte blobs that
//! this crate never deserializes.
use crate::cluster::{ComputeSpec, NodeAllocation, StagedFileMeta};
use crate::error::WireError;
use crate::id::{ComputeId, Hash, Uid};
use crate::job::JobStatus;
use crate::staging::XferFileMeta;
use bytes::{Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Length-delimited, bincode-framed duplex connection. Generic over any
/// `AsyncRead + AsyncWrite` so it wraps a plain `TcpStream` or a TLS stream
/// identically — the TLS layer is assumed to wrap sockets transparently.
pub struct Connection<S> {
    inner: Framed<BufStream<S>, LengthDelimitedCodec>,
}

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let buffered = BufStream::new(stream);
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Connection {
            inner: Framed::new(buffered, codec),
        }
    }

    pub async fn recv<V>(&mut self) -> Option<V>
    where
        V: DeserializeOwned,
    {
        match self.inner.next().await {
            Some(Ok(bytes)) => deserialize(bytes).ok(),
            Some(Err(e)) => {
                tracing::warn!("error reading frame: {:?}", e);
                None
            }
            None => None,
        }
    }

    pub async fn send<V>(&mut self, value: &V) -> Result<(), WireError>
    where
        V: Serialize,
    {
        let bytes = serialize(value)?;
        self.inner
            .send(bytes)
            .await
            .map_err(WireError::Io)
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner().into_inner()
    }
}

fn deserialize<V: DeserializeOwned>(bytes: BytesMut) -> Result<V, WireError> {
    bincode::deserialize(&bytes).map_err(WireError::Serialize)
}

fn serialize<V: Serialize>(value: &V) -> Result<Bytes, WireError> {
    let bytes = bincode::serialize(value).map_err(WireError::Serialize)?;
    Ok(Bytes::from(bytes))
}

// --- Discovery (C3) ---------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub version: String,
    pub ip_addr: IpAddr,
    pub port: u16,
    pub sign: Vec<u8>,
    pub ip_addrs: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub ip_addr: IpAddr,
    pub port: u16,
    pub cpus: usize,
    pub sign: Vec<u8>,
    pub name: String,
    pub scheduler_ip_addr: IpAddr,
    pub auth: String,
}

/// A node's heartbeat, sent on its own `pulse_interval` independently of any
/// ping/pong exchange; carries its current idle capacity so the scheduler
/// can catch a node that under-reported `total_cpus` at discovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub ip_addr: IpAddr,
    pub cpus: usize,
}

/// Sent by a node on clean shutdown so its jobs are rescheduled immediately
/// rather than waiting out a missed-pulse timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatedMsg {
    pub ip_addr: IpAddr,
    pub sign: Vec<u8>,
}

/// Every datagram exchanged over the shared discovery UDP socket: `Ping`
/// flows scheduler -> node, the other three flow node -> scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryDatagram {
    Ping(Ping),
    Pong(Pong),
    Pulse(Pulse),
    Terminated(TerminatedMsg),
}

// --- Client protocol (C4) ---------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub ip_addr: IpAddr,
    pub port: u16,
    pub sign: Vec<u8>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub compute_id: ComputeId,
    pub auth: String,
    pub xfer_files: Vec<StagedFileMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Compute {
        compute: ComputeSpec,
        node_allocs: Vec<NodeAllocation>,
    },
    AddCluster {
        compute_id: ComputeId,
        auth: String,
    },
    Job {
        job: JobSubmission,
    },
    Close {
        compute_id: ComputeId,
        auth: String,
    },
    TerminateJob {
        compute_id: ComputeId,
        uid: Uid,
        auth: String,
    },
    NodeJobs {
        compute_id: ComputeId,
        node: Option<IpAddr>,
        from_node: bool,
        auth: String,
    },
    ResendJobResults {
        compute_id: ComputeId,
        auth: String,
    },
    PendingJobs {
        compute_id: ComputeId,
        auth: String,
    },
    RetrieveJob {
        uid: Uid,
        compute_id: ComputeId,
        auth: String,
        hash: Hash,
    },
    AllocateNode {
        compute_id: ComputeId,
        node_alloc: NodeAllocation,
        auth: String,
    },
    SetNodeCpus {
        compute_id: ComputeId,
        node: IpAddr,
        auth: String,
    },
}

/// Sent over its own freshly dialed connection, one per file: `meta` is the
/// only framed message this connection carries, immediately followed by
/// exactly `meta.size` raw, unframed bytes — `AllocateNode` and friends stay
/// request/reply because their payload is small; a file upload isn't.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileXferRequest {
    pub compute_id: ComputeId,
    pub auth: String,
    pub meta: XferFileMeta,
}

/// The first frame on any client-port connection: either the handshake that
/// opens a request/reply session, or a one-shot file upload. Letting both
/// share a listener avoids a second `--port`-style flag just for uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientConnKind {
    Hello(ClientHello),
    FileXfer(FileXferRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    ComputeCreated {
        compute_id: ComputeId,
        pulse_interval_secs: u64,
        job_result_port: u16,
    },
    Ok,
    Error(String),
    Uid(Uid),
    Uids(Vec<Uid>),
    Count(usize),
    PendingJobsReport {
        done: Vec<Uid>,
        pending: usize,
    },
    JobReplyPayload(Option<JobReply>),
    Cpus(i64),
}

// --- Node protocol (C5) -------------------------------------------------

/// What the scheduler ships to a node to dispatch a job. `payload` is the
/// opaque, already-serialized job code/args blob; this crate never looks
/// inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatch {
    pub uid: Uid,
    pub compute_id: ComputeId,
    pub hash: Hash,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReply {
    pub uid: Uid,
    pub compute_id: ComputeId,
    pub hash: Hash,
    pub status: JobStatus,
    pub cpu_time: f64,
    pub payload: Vec<u8>,
}

/// What the scheduler sends to a node over a freshly dialed connection:
/// either a job to run or a cancellation for one already dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeOutbound {
    Dispatch(JobDispatch),
    Terminate(Uid),
}

/// What a node sends on the result-delivery connection (C5): either a
/// `JobReply` for some dispatched uid, or an explicit shutdown notice.
/// Discovery's own handshake (`Pong`) travels over a separate connection —
/// see `net::discovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeInbound {
    JobReply(JobReply),
    Terminated(TerminatedMsg),
}

/// A node's upload of a job-produced output file, bound for the client
/// rather than scheduler-side staging: `meta` is the only framed message on
/// this connection, immediately followed by exactly `meta.size` raw bytes
/// the scheduler streams straight through to the client's result port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFileXferRequest {
    pub uid: Uid,
    pub compute_id: ComputeId,
    pub meta: XferFileMeta,
}

/// The first frame on any node-facing connection: a one-shot `NodeInbound`
/// message, or a file relay upload. Mirrors `ClientConnKind` on the other
/// side of the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeConnKind {
    Inbound(NodeInbound),
    FileXfer(NodeFileXferRequest),
}

/// What the scheduler sends when dialing out to a client's result port:
/// either a job reply, or the metadata heading a relayed file upload
/// (immediately followed by exactly `meta.size` raw bytes, then a raw
/// `ACK`/`NAK` from the client — see `staging::send_ack`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientDelivery {
    Reply(JobReply),
    FileXfer(NodeFileXferRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Ack {
    Ack,
    Nak,
}

pub const PROTOCOL_VERSION: &str = "4.15";
