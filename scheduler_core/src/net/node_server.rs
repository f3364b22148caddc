//! Node-facing connections (C5, C7): a one-shot listener that accepts
//! `JobReply`/`Terminated` from nodes (or relays a node-initiated file
//! upload straight through to the client), a pair of fresh-connect helpers
//! that dispatch jobs and terminations out to nodes, and the task that
//! drains the engine's `DispatchIntent`s and turns each into one of those
//! actions.
use crate::auth;
use crate::delivery;
use crate::error::{Result, SchedulerError};
use crate::id::Uid;
use crate::net::EngineHandle;
use crate::scheduler::DispatchIntent;
use crate::staging;
use crate::wire::{
    ClientDelivery, Connection, JobDispatch, NodeConnKind, NodeFileXferRequest, NodeInbound,
    NodeOutbound, TerminatedMsg,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accepts one-shot TCP connections on `bind_addr` forever: each connection
/// carries exactly one `NodeConnKind` frame — a `JobReply`/`Terminated`
/// before closing, or a file upload followed by its raw bytes — mirroring
/// how a node dials in fresh for every result it reports.
pub async fn run_result_listener(
    bind_addr: SocketAddr,
    node_secret: Vec<u8>,
    handle: EngineHandle,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "node result listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        let node_secret = node_secret.clone();
        let handle = handle.clone();
        crate::net::spawn("node-result", async move {
            if let Err(e) = handle_one_result(stream, peer, &node_secret, &handle).await {
                tracing::debug!(%peer, error = %e, "node result connection failed");
            }
        });
    }
}

async fn handle_one_result(
    stream: TcpStream,
    peer: SocketAddr,
    node_secret: &[u8],
    handle: &EngineHandle,
) -> Result<()> {
    let mut conn = Connection::new(stream);
    let Some(kind) = conn.recv::<NodeConnKind>().await else {
        return Err(SchedulerError::ConnectionClosed);
    };
    match kind {
        NodeConnKind::Inbound(NodeInbound::JobReply(reply)) => {
            handle.node_reply(peer.ip(), reply).await;
        }
        NodeConnKind::Inbound(NodeInbound::Terminated(TerminatedMsg { ip_addr, sign })) => {
            let expected = auth::auth_code(node_secret, &sign);
            // the node signs with its own secret-derived sign on shutdown;
            // we only have the node's last-known auth_token to compare
            // against, which discovery derived the same way.
            tracing::debug!(%ip_addr, auth = %expected, "node reported its own termination");
            handle.node_terminated(ip_addr).await;
        }
        NodeConnKind::FileXfer(req) => {
            relay_filexfer(conn, req, handle).await;
        }
    }
    Ok(())
}

/// Relays a node-produced output file straight through to the client rather
/// than staging it to disk: dials the client's result port, forwards the
/// metadata and then the raw bytes back-to-back as they arrive from the
/// node, and mirrors the client's ack back to the node. Any failure to
/// reach the client, or a NAK from it, is reported to the node as a NAK.
async fn relay_filexfer(conn: Connection<TcpStream>, req: NodeFileXferRequest, handle: &EngineHandle) {
    let mut raw_node = conn.into_inner();

    let ok = relay_filexfer_inner(&mut raw_node, &req, handle).await;
    let _ = staging::send_ack(&mut raw_node, ok).await;
}

async fn relay_filexfer_inner(
    raw_node: &mut TcpStream,
    req: &NodeFileXferRequest,
    handle: &EngineHandle,
) -> bool {
    let Some((client_ip, client_result_port, _dest_path)) =
        handle.cluster_delivery_info(req.compute_id).await
    else {
        tracing::debug!(compute_id = req.compute_id, "cluster gone before filexfer could be relayed");
        return false;
    };

    let Ok(client_stream) = TcpStream::connect((client_ip, client_result_port)).await else {
        tracing::debug!(compute_id = req.compute_id, "failed to reach client for filexfer relay");
        return false;
    };

    let mut conn = Connection::new(client_stream);
    if conn
        .send(&ClientDelivery::FileXfer(req.clone()))
        .await
        .is_err()
    {
        return false;
    }
    let mut raw_client = conn.into_inner();

    let mut limited = (&mut *raw_node).take(req.meta.size);
    if tokio::io::copy(&mut limited, &mut raw_client).await.is_err() {
        return false;
    }
    if raw_client.flush().await.is_err() {
        return false;
    }

    staging::recv_ack(&mut raw_client).await
}

/// Dials out fresh to `node_ip:node_port` and ships one job. A connect or
/// write failure is the caller's cue to report `env_error = true` back to
/// the engine via `EngineHandle::dispatch_failed`.
pub async fn dispatch_job(
    node_ip: IpAddr,
    node_port: u16,
    msg_timeout: Duration,
    dispatch: JobDispatch,
) -> Result<()> {
    let stream = tokio::time::timeout(
        msg_timeout,
        TcpStream::connect((node_ip, node_port)),
    )
    .await
    .map_err(|_| SchedulerError::Timeout(msg_timeout))??;
    let mut conn = Connection::new(stream);
    conn.send(&NodeOutbound::Dispatch(dispatch)).await?;
    Ok(())
}

pub async fn send_terminate(
    node_ip: IpAddr,
    node_port: u16,
    msg_timeout: Duration,
    uid: Uid,
) -> Result<()> {
    let stream = tokio::time::timeout(
        msg_timeout,
        TcpStream::connect((node_ip, node_port)),
    )
    .await
    .map_err(|_| SchedulerError::Timeout(msg_timeout))??;
    let mut conn = Connection::new(stream);
    conn.send(&NodeOutbound::Terminate(uid)).await?;
    Ok(())
}

/// Best-effort delivery of a status push to a client's registered
/// `status_callback_endpoint`. Failures are logged, never propagated —
/// a client that doesn't want these never opens the listening side.
async fn notify_job_status(endpoint: &str, uid: Uid, status: crate::job::JobStatus) {
    let Ok(addr) = endpoint.parse::<SocketAddr>() else {
        tracing::debug!(endpoint, "status_callback_endpoint is not a valid socket address");
        return;
    };
    match tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let mut conn = Connection::new(stream);
            let view = crate::job::JobView { uid, status, start_time: None, end_time: None };
            let _ = conn.send(&view).await;
        }
        _ => tracing::debug!(endpoint, uid, "status callback delivery failed"),
    }
}

/// Same best-effort push as `notify_job_status`, but for a node's own
/// `Initialized`/`Closed` status rather than a job's.
async fn notify_node_status(endpoint: &str, ip: IpAddr, status: crate::node::NodeStatusKind) {
    let Ok(addr) = endpoint.parse::<SocketAddr>() else {
        tracing::debug!(endpoint, "status_callback_endpoint is not a valid socket address");
        return;
    };
    match tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let mut conn = Connection::new(stream);
            let view = crate::node::NodeStatusView { ip_addr: ip, status };
            let _ = conn.send(&view).await;
        }
        _ => tracing::debug!(endpoint, %ip, "node status callback delivery failed"),
    }
}

/// Drains `intent_rx` forever, turning each `DispatchIntent` the engine
/// produces into the corresponding socket action. This is the one task that
/// owns outbound node connections and client-delivery connections, so the
/// engine loop itself never touches a socket directly.
pub async fn run_dispatch_loop(
    mut intent_rx: mpsc::Receiver<DispatchIntent>,
    node_port: u16,
    msg_timeout: Duration,
    handle: EngineHandle,
) {
    while let Some(intent) = intent_rx.recv().await {
        match intent {
            DispatchIntent::SendJob { node, job } => {
                let dispatch = JobDispatch {
                    uid: job.uid,
                    compute_id: job.compute_id,
                    hash: job.hash,
                    payload: Vec::new(),
                };
                let uid = job.uid;
                match dispatch_job(node, node_port, msg_timeout, dispatch).await {
                    Ok(()) => {}
                    Err(SchedulerError::Io(_)) | Err(SchedulerError::Timeout(_)) => {
                        handle.dispatch_failed(uid, true).await;
                    }
                    Err(_) => {
                        handle.dispatch_failed(uid, false).await;
                    }
                }
            }
            DispatchIntent::NotifyJobStatus { endpoint, uid, status } => {
                notify_job_status(&endpoint, uid, status).await;
            }
            DispatchIntent::NotifyNodeStatus { endpoint, ip, status } => {
                notify_node_status(&endpoint, ip, status).await;
            }
            DispatchIntent::SendTerminateToNode { node, uid } => {
                if let Err(e) = send_terminate(node, node_port, msg_timeout, uid).await {
                    tracing::debug!(%node, uid, error = %e, "failed to deliver job termination");
                }
            }
            DispatchIntent::DeliverReply { compute_id, reply } => {
                deliver_reply(compute_id, reply, &handle).await;
            }
            DispatchIntent::CleanupCluster { compute_id } => {
                handle.retire_cluster(compute_id).await;
            }
        }
    }
}

async fn deliver_reply(
    compute_id: crate::id::ComputeId,
    reply: crate::wire::JobReply,
    handle: &EngineHandle,
) {
    let Some((client_ip, client_port, dest_path)) =
        handle.cluster_delivery_info(compute_id).await
    else {
        tracing::debug!(compute_id, uid = reply.uid, "cluster gone before reply could be delivered");
        return;
    };

    let delivered = match TcpStream::connect((client_ip, client_port)).await {
        Ok(stream) => {
            let mut conn = Connection::new(stream);
            delivery::send_over(&mut conn, &reply).await.unwrap_or(false)
        }
        Err(_) => false,
    };

    if delivered {
        // per §4.7: a successful delivery clears the scheduler's own record
        // of the reply — a no-op if `reply` was only provisional, since
        // those never get moved into `done_jobs` in the first place.
        handle.reply_delivered(reply.uid).await;
        // per §4.5: a terminal reply that drains the last pending job of an
        // already-zombie cluster retires it immediately, rather than
        // waiting for the next zombie-sweep tick to notice.
        if handle.is_retirable(compute_id).await {
            handle.retire_cluster(compute_id).await;
        }
    } else {
        match delivery::spool(&dest_path, &reply).await {
            Ok(()) => handle.reply_spooled(compute_id).await,
            Err(e) => tracing::warn!(uid = reply.uid, error = %e, "failed to spool undelivered reply"),
        }
    }
}

/// Opportunistic resend of everything spooled for `compute_id`, triggered
/// either by a `RESEND_JOB_RESULTS:` request or a pulse tick noticing
/// outstanding spooled replies on a non-zombie cluster.
pub async fn resend_pending(compute_id: crate::id::ComputeId, handle: &EngineHandle) {
    let Some((client_ip, client_port, dest_path)) = handle.cluster_delivery_info(compute_id).await
    else {
        return;
    };
    let uids = delivery::list_spooled(&dest_path, delivery::RESEND_BATCH_CAP).await;
    for uid in uids {
        let Some(reply) = delivery::load_spooled(&dest_path, uid).await else {
            continue;
        };
        let delivered = match TcpStream::connect((client_ip, client_port)).await {
            Ok(stream) => {
                let mut conn = Connection::new(stream);
                delivery::send_over(&mut conn, &reply).await.unwrap_or(false)
            }
            Err(_) => false,
        };
        if delivered {
            let _ = delivery::delete_spooled(&dest_path, uid).await;
            handle.reply_delivered(uid).await;
            handle.reply_resent(compute_id).await;
        }
    }
}
