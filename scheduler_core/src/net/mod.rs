//! Wires the decision engine in `scheduler` to real sockets. The engine
//! itself is owned by exactly one task (`spawn_engine`); every other task —
//! discovery, the client server, the node server — talks to it over an
//! `EngineHandle` instead of sharing a lock. This mirrors this codebase's own
//! preference for message-passing over shared mutable state between workers.
pub mod client_server;
pub mod discovery;
pub mod node_server;

use crate::cluster::{ComputeSpec, NodeAllocation};
use crate::config::Config;
use crate::delivery;
use crate::error::Result;
use crate::id::{ComputeId, Uid};
use crate::job::{JobView, ScheduledJob};
use crate::node::{NodeInfo, UpsertOutcome};
use crate::scheduler::{DispatchIntent, SchedulerEngine, TerminateOutcome, TickOutcome};
use crate::wire::JobReply;
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Spawns `fut` as a tracked task, logging its name on exit. A thin stand-in
/// for a supervised spawn: nothing restarts a failed task today, but every
/// exit is at least visible in the logs instead of vanishing silently.
pub fn spawn<F>(name: &'static str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        fut.await;
        tracing::debug!(task = name, "task exited");
    })
}

/// Requests sent by net tasks to the single task that owns `SchedulerEngine`.
/// Every mutation of the node/cluster registries goes through here.
pub enum EngineCommand {
    DiscoverNode {
        info: NodeInfo,
        reply: oneshot::Sender<UpsertOutcome>,
    },
    NodeReply {
        from_node: IpAddr,
        reply: JobReply,
    },
    NodeTerminated {
        ip: IpAddr,
    },
    DispatchFailed {
        uid: Uid,
        env_error: bool,
    },
    CreateCluster {
        compute: ComputeSpec,
        node_allocs: Vec<NodeAllocation>,
        client_auth: String,
        reply: oneshot::Sender<Result<ComputeId>>,
    },
    SubmitJob {
        compute_id: ComputeId,
        xfer_files: Vec<crate::job::XferFile>,
        reply: oneshot::Sender<Option<Uid>>,
    },
    TerminateJob {
        compute_id: ComputeId,
        uid: Uid,
        reply: oneshot::Sender<TerminateOutcome>,
    },
    CloseCluster {
        compute_id: ComputeId,
    },
    ClusterDeliveryInfo {
        compute_id: ComputeId,
        reply: oneshot::Sender<Option<(IpAddr, u16, std::path::PathBuf)>>,
    },
    RetireCluster {
        compute_id: ComputeId,
    },
    NodePulse {
        ip: IpAddr,
    },
    ReplySpooled {
        compute_id: ComputeId,
    },
    ReplyResent {
        compute_id: ComputeId,
    },
    Tick {
        reply: oneshot::Sender<TickOutcome>,
    },
    PendingJobs {
        compute_id: ComputeId,
        reply: oneshot::Sender<(Vec<Uid>, usize)>,
    },
    JobStatus {
        uid: Uid,
        reply: oneshot::Sender<Option<JobView>>,
    },
    VerifyCluster {
        compute_id: ComputeId,
        auth: String,
        reply: oneshot::Sender<Option<std::path::PathBuf>>,
    },
    ListClusterJobs {
        compute_id: ComputeId,
        reply: oneshot::Sender<Vec<Uid>>,
    },
    AddNodeAlloc {
        compute_id: ComputeId,
        alloc: NodeAllocation,
    },
    NodeCpus {
        compute_id: ComputeId,
        ip: IpAddr,
        reply: oneshot::Sender<i64>,
    },
    ClusterCounts {
        compute_id: ComputeId,
        reply: oneshot::Sender<Option<(usize, usize)>>,
    },
    ClusterProbeInfo {
        compute_id: ComputeId,
        reply: oneshot::Sender<
            Option<(std::path::PathBuf, Vec<crate::cluster::StagedFileMeta>, Vec<NodeAllocation>)>,
        >,
    },
    IsRetirable {
        compute_id: ComputeId,
        reply: oneshot::Sender<bool>,
    },
    ReplyDelivered {
        uid: Uid,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<crate::scheduler::EngineSnapshot>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn discover_node(&self, info: NodeInfo) -> UpsertOutcome {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(EngineCommand::DiscoverNode { info, reply }).await;
        rx.await.unwrap_or(UpsertOutcome::New)
    }

    pub async fn node_reply(&self, from_node: IpAddr, reply: JobReply) {
        let _ = self.tx.send(EngineCommand::NodeReply { from_node, reply }).await;
    }

    pub async fn node_terminated(&self, ip: IpAddr) {
        let _ = self.tx.send(EngineCommand::NodeTerminated { ip }).await;
    }

    /// Reported by the dispatch task when a fresh outbound connection to a
    /// node failed: `env_error` distinguishes a refused/unreachable socket
    /// (requeue at the head, drop the node from the cluster) from any other
    /// failure (requeue at the tail).
    pub async fn dispatch_failed(&self, uid: Uid, env_error: bool) {
        let _ = self.tx.send(EngineCommand::DispatchFailed { uid, env_error }).await;
    }

    pub async fn create_cluster(
        &self,
        compute: ComputeSpec,
        node_allocs: Vec<NodeAllocation>,
        client_auth: String,
    ) -> Result<ComputeId> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::CreateCluster {
                compute,
                node_allocs,
                client_auth,
                reply,
            })
            .await;
        rx.await
            .unwrap_or(Err(crate::error::SchedulerError::ConnectionClosed))
    }

    pub async fn submit_job(
        &self,
        compute_id: ComputeId,
        xfer_files: Vec<crate::job::XferFile>,
    ) -> Option<Uid> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::SubmitJob { compute_id, xfer_files, reply })
            .await;
        rx.await.ok().flatten()
    }

    pub async fn terminate_job(&self, compute_id: ComputeId, uid: Uid) -> TerminateOutcome {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::TerminateJob { compute_id, uid, reply })
            .await;
        rx.await.unwrap_or(TerminateOutcome::NotFound)
    }

    pub async fn close_cluster(&self, compute_id: ComputeId) {
        let _ = self.tx.send(EngineCommand::CloseCluster { compute_id }).await;
    }

    /// The `(client_ip, client_result_port, dest_path)` a delivered reply
    /// needs, looked up fresh for every delivery since a cluster can be
    /// retired between dispatch and reply.
    pub async fn cluster_delivery_info(
        &self,
        compute_id: ComputeId,
    ) -> Option<(IpAddr, u16, std::path::PathBuf)> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::ClusterDeliveryInfo { compute_id, reply })
            .await;
        rx.await.ok().flatten()
    }

    pub async fn retire_cluster(&self, compute_id: ComputeId) {
        let _ = self.tx.send(EngineCommand::RetireCluster { compute_id }).await;
    }

    pub async fn node_pulse(&self, ip: IpAddr) {
        let _ = self.tx.send(EngineCommand::NodePulse { ip }).await;
    }

    pub async fn reply_spooled(&self, compute_id: ComputeId) {
        let _ = self.tx.send(EngineCommand::ReplySpooled { compute_id }).await;
    }

    pub async fn reply_resent(&self, compute_id: ComputeId) {
        let _ = self.tx.send(EngineCommand::ReplyResent { compute_id }).await;
    }

    /// Drives one timer tick: sweeps dead nodes and zombie clusters,
    /// returning what the net layer still needs to act on over real
    /// sockets (ping targets, resend candidates).
    pub async fn tick(&self) -> TickOutcome {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(EngineCommand::Tick { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn pending_jobs(&self, compute_id: ComputeId) -> (Vec<Uid>, usize) {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::PendingJobs { compute_id, reply })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn job_status(&self, uid: Uid) -> Option<JobView> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(EngineCommand::JobStatus { uid, reply }).await;
        rx.await.ok().flatten()
    }

    /// Whether `compute_id` is a drained zombie right now — checked right
    /// after a successful reply delivery so cleanup doesn't have to wait for
    /// the next zombie-sweep tick, per §4.5.
    pub async fn is_retirable(&self, compute_id: ComputeId) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::IsRetirable { compute_id, reply })
            .await;
        rx.await.unwrap_or(false)
    }

    /// Clears the scheduler's own record of a terminal reply once the net
    /// layer has confirmed it reached the client, per §4.7.
    pub async fn reply_delivered(&self, uid: Uid) {
        let _ = self.tx.send(EngineCommand::ReplyDelivered { uid }).await;
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(EngineCommand::Shutdown { reply }).await;
        let _ = rx.await;
    }

    /// Read-only registry-size snapshot for the timer's periodic stats log
    /// and the optional HTTP dashboard.
    pub async fn snapshot(&self) -> crate::scheduler::EngineSnapshot {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(EngineCommand::Snapshot { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Checks `auth` against the cluster's own, returning its `dest_path` on
    /// success — the gate every authenticated client request but `Compute`
    /// goes through before touching the engine further.
    pub async fn verify_cluster(
        &self,
        compute_id: ComputeId,
        auth: String,
    ) -> Option<std::path::PathBuf> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::VerifyCluster { compute_id, auth, reply })
            .await;
        rx.await.ok().flatten()
    }

    pub async fn list_cluster_jobs(&self, compute_id: ComputeId) -> Vec<Uid> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::ListClusterJobs { compute_id, reply })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn add_node_alloc(&self, compute_id: ComputeId, alloc: NodeAllocation) {
        let _ = self
            .tx
            .send(EngineCommand::AddNodeAlloc { compute_id, alloc })
            .await;
    }

    pub async fn node_cpus(&self, compute_id: ComputeId, ip: IpAddr) -> i64 {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::NodeCpus { compute_id, ip, reply })
            .await;
        rx.await.unwrap_or(-1)
    }

    pub async fn cluster_counts(&self, compute_id: ComputeId) -> Option<(usize, usize)> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::ClusterCounts { compute_id, reply })
            .await;
        rx.await.ok().flatten()
    }

    /// `ADD_CLUSTER:`'s read side: the cluster's dest_path, its expected
    /// transfer files, and its node allocations, so the client server can
    /// validate staging and kick off a fresh probe in one round trip.
    pub async fn cluster_probe_info(
        &self,
        compute_id: ComputeId,
    ) -> Option<(std::path::PathBuf, Vec<crate::cluster::StagedFileMeta>, Vec<NodeAllocation>)> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(EngineCommand::ClusterProbeInfo { compute_id, reply })
            .await;
        rx.await.ok().flatten()
    }
}

/// Runs the engine loop on its own task: owns `SchedulerEngine` exclusively,
/// drains `EngineCommand`s, and drives the dispatch loop whenever a node or
/// job becomes available. Every `DispatchIntent` it produces is handed to
/// `intent_rx`'s consumer, which owns the actual sockets — a fresh outbound
/// connection per dispatch, exactly like a result delivery or a termination
/// notice, so this module stays free of socket types.
pub fn spawn_engine(
    config: Config,
    policy: Box<dyn crate::policy::Policy>,
) -> (EngineHandle, mpsc::Receiver<DispatchIntent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<EngineCommand>(1024);
    let (intent_tx, intent_rx) = mpsc::channel::<DispatchIntent>(1024);

    spawn("engine", async move {
        let mut engine = SchedulerEngine::new(policy);

        loop {
            let drained = drive_dispatch_loop(&mut engine, &intent_tx).await;
            if engine.terminate && !drained {
                break;
            }
            let Some(cmd) = cmd_rx.recv().await else {
                break;
            };
            if !handle_command(&mut engine, &intent_tx, &config, cmd).await {
                break;
            }
        }
    });

    (EngineHandle { tx: cmd_tx }, intent_rx)
}

/// Pops every currently-dispatchable (node, job) pair and ships a `SendJob`
/// intent for each; the dispatch is considered accepted as soon as it's
/// handed off, the same way a fresh outbound connection per job is
/// considered accepted once it's queued to be dialed. Returns whether
/// anything was dispatched this pass.
async fn drive_dispatch_loop(
    engine: &mut SchedulerEngine,
    intent_tx: &mpsc::Sender<DispatchIntent>,
) -> bool {
    let mut dispatched = false;
    while let Some((ip, uid)) = engine.pick() {
        let Some(job) = engine.begin_dispatch(ip, uid) else {
            break;
        };
        dispatched = true;
        engine.dispatch_succeeded(uid);
        let endpoint = engine
            .clusters
            .get(job.compute_id)
            .and_then(|c| c.status_callback_endpoint.clone());
        if let Some(endpoint) = endpoint {
            let _ = intent_tx
                .send(DispatchIntent::NotifyJobStatus {
                    endpoint,
                    uid,
                    status: crate::job::JobStatus::Running,
                })
                .await;
        }
        let _ = intent_tx.send(DispatchIntent::SendJob { node: ip, job }).await;
    }
    dispatched
}

async fn send_initialized(
    engine: &SchedulerEngine,
    intent_tx: &mpsc::Sender<DispatchIntent>,
    compute_id: ComputeId,
    ip: IpAddr,
) {
    if let Some(endpoint) = engine.clusters.get(compute_id).and_then(|c| c.status_callback_endpoint.clone()) {
        let _ = intent_tx
            .send(DispatchIntent::NotifyNodeStatus {
                endpoint,
                ip,
                status: crate::node::NodeStatusKind::Initialized,
            })
            .await;
    }
}

async fn send_closed(
    engine: &SchedulerEngine,
    intent_tx: &mpsc::Sender<DispatchIntent>,
    compute_id: ComputeId,
    ip: IpAddr,
) {
    if let Some(endpoint) = engine.clusters.get(compute_id).and_then(|c| c.status_callback_endpoint.clone()) {
        let _ = intent_tx
            .send(DispatchIntent::NotifyNodeStatus {
                endpoint,
                ip,
                status: crate::node::NodeStatusKind::Closed,
            })
            .await;
    }
}

async fn handle_command(
    engine: &mut SchedulerEngine,
    intent_tx: &mpsc::Sender<DispatchIntent>,
    config: &Config,
    cmd: EngineCommand,
) -> bool {
    match cmd {
        EngineCommand::DiscoverNode { info, reply } => {
            let ip = info.ip_addr;
            let outcome = engine.nodes.upsert(info, Instant::now());
            if let UpsertOutcome::Restarted { ref dead_job_uids } = outcome {
                let replies = engine.reschedule_jobs(dead_job_uids.clone());
                for r in replies {
                    let _ = intent_tx
                        .send(DispatchIntent::DeliverReply { compute_id: r.compute_id, reply: r })
                        .await;
                }
            }
            for compute_id in engine.setup_node(ip) {
                send_initialized(engine, intent_tx, compute_id, ip).await;
            }
            let _ = reply.send(outcome);
        }
        EngineCommand::NodeReply { from_node, reply } => {
            if let Some(intent) = engine.handle_job_reply(from_node, reply) {
                let _ = intent_tx.send(intent).await;
            }
        }
        EngineCommand::NodeTerminated { ip } => {
            let (replies, closed_clusters) = engine.node_died(ip);
            for r in replies {
                let _ = intent_tx
                    .send(DispatchIntent::DeliverReply { compute_id: r.compute_id, reply: r })
                    .await;
            }
            for compute_id in closed_clusters {
                send_closed(engine, intent_tx, compute_id, ip).await;
            }
        }
        EngineCommand::DispatchFailed { uid, env_error } => {
            if env_error {
                engine.dispatch_env_error(uid);
            } else {
                engine.dispatch_other_error(uid);
            }
        }
        EngineCommand::CreateCluster { compute, node_allocs, client_auth, reply } => {
            let result = engine
                .clusters
                .create(compute, node_allocs, client_auth, config)
                .await;
            if let Ok(compute_id) = result {
                for ip in engine.setup_cluster(compute_id) {
                    send_initialized(engine, intent_tx, compute_id, ip).await;
                }
            }
            let _ = reply.send(result);
        }
        EngineCommand::SubmitJob { compute_id, xfer_files, reply } => {
            let assigned = engine.submit_job(compute_id, xfer_files);
            let _ = reply.send(assigned);
        }
        EngineCommand::TerminateJob { compute_id, uid, reply } => {
            let outcome = engine.terminate_job(compute_id, uid);
            match &outcome {
                TerminateOutcome::RunningNotifyNode(ip) => {
                    let _ = intent_tx
                        .send(DispatchIntent::SendTerminateToNode { node: *ip, uid })
                        .await;
                }
                TerminateOutcome::QueuedCancelled(cancelled) => {
                    let _ = intent_tx
                        .send(DispatchIntent::DeliverReply {
                            compute_id,
                            reply: cancelled.clone(),
                        })
                        .await;
                }
                TerminateOutcome::AlreadyTerminal | TerminateOutcome::NotFound => {}
            }
            let _ = reply.send(outcome);
        }
        EngineCommand::CloseCluster { compute_id } => {
            if engine.close_cluster(compute_id) {
                let _ = intent_tx.send(DispatchIntent::CleanupCluster { compute_id }).await;
            }
        }
        EngineCommand::ClusterDeliveryInfo { compute_id, reply } => {
            let info = engine
                .clusters
                .get(compute_id)
                .map(|c| (c.client_ip, c.client_result_port, c.dest_path.clone()));
            let _ = reply.send(info);
        }
        EngineCommand::RetireCluster { compute_id } => {
            engine.clusters.retire(compute_id);
        }
        EngineCommand::NodePulse { ip } => {
            engine.record_pulse(ip);
        }
        EngineCommand::ReplySpooled { compute_id } => {
            engine.reply_spooled(compute_id);
        }
        EngineCommand::ReplyResent { compute_id } => {
            if engine.reply_resent(compute_id) {
                let _ = intent_tx.send(DispatchIntent::CleanupCluster { compute_id }).await;
            }
        }
        EngineCommand::Tick { reply } => {
            let (dead_replies, closed) = engine.pulse_sweep(config.pulse_timeout());
            for r in dead_replies {
                let _ = intent_tx
                    .send(DispatchIntent::DeliverReply { compute_id: r.compute_id, reply: r })
                    .await;
            }
            for (ip, compute_id) in closed {
                send_closed(engine, intent_tx, compute_id, ip).await;
            }
            let retirable = engine.zombie_sweep(config.zombie_interval);
            for compute_id in retirable {
                let _ = intent_tx.send(DispatchIntent::CleanupCluster { compute_id }).await;
            }
            let _ = reply.send(engine.tick_outcome());
        }
        EngineCommand::PendingJobs { compute_id, reply } => {
            let cluster_state = engine
                .clusters
                .get(compute_id)
                .map(|c| (c.pending_jobs_count, c.dest_path.clone()));
            let (pending, done) = match cluster_state {
                Some((pending, dest_path)) => {
                    let done =
                        delivery::list_spooled(&dest_path, delivery::PENDING_JOBS_REPORT_CAP)
                            .await;
                    (pending, done)
                }
                None => (0, Vec::new()),
            };
            let _ = reply.send((done, pending));
        }
        EngineCommand::JobStatus { uid, reply } => {
            let view = engine
                .sched_jobs
                .get(&uid)
                .or_else(|| engine.done_jobs.get(&uid))
                .map(ScheduledJob::view);
            let _ = reply.send(view);
        }
        EngineCommand::VerifyCluster { compute_id, auth, reply } => {
            let _ = reply.send(engine.verify_cluster(compute_id, &auth));
        }
        EngineCommand::ListClusterJobs { compute_id, reply } => {
            let _ = reply.send(engine.list_cluster_jobs(compute_id));
        }
        EngineCommand::AddNodeAlloc { compute_id, alloc } => {
            engine.add_node_alloc(compute_id, alloc);
            for ip in engine.setup_cluster(compute_id) {
                send_initialized(engine, intent_tx, compute_id, ip).await;
            }
        }
        EngineCommand::NodeCpus { compute_id, ip, reply } => {
            let _ = reply.send(engine.node_cpus(compute_id, ip));
        }
        EngineCommand::ClusterCounts { compute_id, reply } => {
            let _ = reply.send(engine.cluster_counts(compute_id));
        }
        EngineCommand::ClusterProbeInfo { compute_id, reply } => {
            let _ = reply.send(engine.cluster_probe_info(compute_id));
        }
        EngineCommand::IsRetirable { compute_id, reply } => {
            let _ = reply.send(engine.cluster_is_retirable(compute_id));
        }
        EngineCommand::ReplyDelivered { uid } => {
            engine.reply_delivered(uid);
        }
        EngineCommand::Shutdown { reply } => {
            let replies = engine.shutdown();
            for r in replies {
                let _ = intent_tx
                    .send(DispatchIntent::DeliverReply { compute_id: r.compute_id, reply: r })
                    .await;
            }
            let _ = reply.send(());
            return false;
        }
        EngineCommand::Snapshot { reply } => {
            let _ = reply.send(engine.snapshot());
        }
    }
    true
}
