//! The scheduler loop (C6): matches unscheduled jobs to idle node CPU
//! slots, dispatches, and handles reschedule/abandon on node death. This
//! module holds only the decision logic — no sockets. The `net` module
//! drives it from real connections and executes the `DispatchIntent`s it
//! returns.
use crate::cluster::{Cluster, ClusterRegistry, DispyNodeStats, NodeAllocation};
use crate::job::{JobStatus, ScheduledJob, XferFile};
use crate::node::{NodeRegistry, NodeStatusKind, UpsertOutcome};
use crate::policy::{LoadBalance, Policy};
use crate::wire::JobReply;
use crate::HashMap;
use crate::id::{ComputeId, IdGen, Uid};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;

/// Wakes the scheduler loop whenever something it might care about
/// happened: a new job, a node coming up, a reply, a death.
pub type SchedulerEvent = Arc<Notify>;

pub fn new_scheduler_event() -> SchedulerEvent {
    Arc::new(Notify::new())
}

/// What the net layer should do after a state transition that the engine
/// itself cannot perform (it owns no sockets).
#[derive(Debug)]
pub enum DispatchIntent {
    SendJob { node: IpAddr, job: ScheduledJob },
    NotifyJobStatus { endpoint: String, uid: Uid, status: JobStatus },
    NotifyNodeStatus { endpoint: String, ip: IpAddr, status: NodeStatusKind },
    SendTerminateToNode { node: IpAddr, uid: Uid },
    DeliverReply { compute_id: ComputeId, reply: JobReply },
    CleanupCluster { compute_id: ComputeId },
}

/// What a timer tick hands back to the net layer for the parts it can't do
/// itself (no sockets in the engine): node allocations that still need a
/// fresh discovery ping, and clusters worth an opportunistic resend pass.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub missing_allocations: Vec<(ComputeId, Vec<NodeAllocation>)>,
    pub resend_candidates: Vec<ComputeId>,
}

#[derive(Debug)]
pub enum TerminateOutcome {
    /// Carries the `Cancelled` reply the caller should deliver through the
    /// normal result-delivery path (C7), exactly like any other terminal
    /// reply.
    QueuedCancelled(JobReply),
    RunningNotifyNode(IpAddr),
    AlreadyTerminal,
    NotFound,
}

/// Owns the node and cluster registries plus the dispatch bookkeeping
/// (`sched_jobs`, `done_jobs`). Mutated exclusively by the single
/// scheduler-loop task.
pub struct SchedulerEngine {
    pub nodes: NodeRegistry,
    pub clusters: ClusterRegistry,
    pub sched_jobs: HashMap<Uid, ScheduledJob>,
    pub done_jobs: HashMap<Uid, ScheduledJob>,
    pub policy: Box<dyn Policy>,
    pub terminate: bool,
    retry_counts: HashMap<Uid, u32>,
    job_ids: IdGen,
}

impl Default for SchedulerEngine {
    fn default() -> Self {
        Self::new(Box::new(LoadBalance))
    }
}

impl SchedulerEngine {
    pub fn new(policy: Box<dyn Policy>) -> Self {
        SchedulerEngine {
            nodes: NodeRegistry::new(),
            clusters: ClusterRegistry::new(),
            sched_jobs: HashMap::default(),
            done_jobs: HashMap::default(),
            policy,
            terminate: false,
            retry_counts: HashMap::default(),
            job_ids: IdGen::new(),
        }
    }

    /// Enqueues a new job onto `compute_id`'s cluster, returning its fresh
    /// uid, or `None` if the cluster doesn't exist (already closed, or the
    /// client never created it).
    pub fn submit_job(&mut self, compute_id: ComputeId, xfer_files: Vec<XferFile>) -> Option<Uid> {
        let cluster = self.clusters.get_mut(compute_id)?;
        let uid = self.job_ids.next();
        cluster.enqueue(ScheduledJob::new(uid, compute_id, xfer_files));
        cluster.touch(Instant::now());
        Some(uid)
    }

    /// Selects one (node, job) pair to dispatch: pick a node with the
    /// policy, then pop a FIFO job from any cluster the node is allowed to
    /// serve whose queue is nonempty. Does not yet touch the node's
    /// `busy_count` or the cluster's pending count — `begin_dispatch` does
    /// that once the caller has the pair.
    pub fn pick(&mut self) -> Option<(IpAddr, Uid)> {
        let clusters = &self.clusters;
        let ip = self.policy.select(&self.nodes, &|node| {
            node.cluster_ids.iter().any(|cid| {
                clusters
                    .get(*cid)
                    .map(|c| c.nonempty_queue())
                    .unwrap_or(false)
            })
        })?;
        let node = self.nodes.lookup(&ip)?;
        let cluster_id = node
            .cluster_ids
            .iter()
            .copied()
            .find(|cid| {
                self.clusters
                    .get(*cid)
                    .map(|c| c.nonempty_queue())
                    .unwrap_or(false)
            })?;
        let cluster = self.clusters.get(cluster_id)?;
        let uid = cluster.jobs_queue.front()?.uid;
        Some((ip, uid))
    }

    /// Commits a (node, job) pair picked by `pick`: pops the job off its
    /// cluster's queue, assigns it to the node, and moves it into
    /// `sched_jobs`. Returns the job so the caller can build a
    /// `DispatchIntent::SendJob`.
    pub fn begin_dispatch(&mut self, ip: IpAddr, uid: Uid) -> Option<ScheduledJob> {
        let node = self.nodes.lookup(&ip)?;
        let cluster_id = node
            .cluster_ids
            .iter()
            .copied()
            .find(|cid| {
                self.clusters
                    .get(*cid)
                    .map(|c| c.jobs_queue.front().map(|j| j.uid) == Some(uid))
                    .unwrap_or(false)
            })?;
        let cluster = self.clusters.get_mut(cluster_id)?;
        let mut job = cluster.jobs_queue.pop_front()?;
        job.assigned_node = Some(ip);
        self.nodes.assign(&ip, uid);
        job.status = JobStatus::Created;
        self.sched_jobs.insert(uid, job.clone());
        Some(job)
    }

    /// Called once the node has accepted the dispatch: marks the job
    /// Running and records its start time.
    pub fn dispatch_succeeded(&mut self, uid: Uid) -> Option<&ScheduledJob> {
        if let Some(job) = self.sched_jobs.get_mut(&uid) {
            job.status = JobStatus::Running;
            job.start_time = Some(SystemTime::now());
        }
        self.sched_jobs.get(&uid)
    }

    /// `EnvironmentError`-class I/O on dispatch: remove the node from the
    /// cluster's node set, requeue at the head. No delay before re-dispatch
    /// is intentional.
    pub fn dispatch_env_error(&mut self, uid: Uid) {
        if let Some(mut job) = self.sched_jobs.remove(&uid) {
            let ip = job.assigned_node.take();
            if let Some(ip) = ip {
                self.nodes.discard_uid(&ip, uid);
                if let Some(node) = self.nodes.lookup_mut(&ip) {
                    node.busy_count = node.busy_count.saturating_sub(1);
                }
                let compute_id = job.compute_id;
                if let Some(node) = self.nodes.lookup_mut(&ip) {
                    node.cluster_ids.remove(&compute_id);
                }
                if let Some(cluster) = self.clusters.get_mut(compute_id) {
                    cluster.dispy_nodes.remove(&ip);
                }
            }
            job.status = JobStatus::Created;
            if let Some(cluster) = self.clusters.get_mut(job.compute_id) {
                cluster.jobs_queue.push_front(job);
            }
        }
    }

    /// Any other dispatch error: requeue at the tail, log by the caller.
    /// Tracks a per-job retry count purely for observability — this doesn't
    /// cap retries, it only makes them visible against the livelock risk of
    /// a persistently failing node.
    pub fn dispatch_other_error(&mut self, uid: Uid) -> u32 {
        if let Some(mut job) = self.sched_jobs.remove(&uid) {
            if let Some(ip) = job.assigned_node.take() {
                self.nodes.discard_uid(&ip, uid);
                if let Some(node) = self.nodes.lookup_mut(&ip) {
                    node.busy_count = node.busy_count.saturating_sub(1);
                }
            }
            job.status = JobStatus::Created;
            let compute_id = job.compute_id;
            if let Some(cluster) = self.clusters.get_mut(compute_id) {
                cluster.jobs_queue.push_back(job);
            }
        }
        let count = self.retry_counts.entry(uid).or_insert(0);
        *count += 1;
        *count
    }

    /// Handles a `JOB_REPLY:` from a node. Returns `Some(intent)` describing
    /// what to do next, or `None` if the reply should be silently dropped
    /// (stale hash, unknown uid, wrong node).
    pub fn handle_job_reply(
        &mut self,
        from_node: IpAddr,
        reply: JobReply,
    ) -> Option<DispatchIntent> {
        let job = self.sched_jobs.get(&reply.uid)?;
        if job.hash != reply.hash || job.assigned_node != Some(from_node) {
            tracing::debug!(uid = reply.uid, "dropping reply with stale hash or wrong node");
            return None;
        }

        if reply.status == JobStatus::ProvisionalResult {
            let compute_id = reply.compute_id;
            return Some(DispatchIntent::DeliverReply { compute_id, reply });
        }

        let mut job = self.sched_jobs.remove(&reply.uid)?;
        job.status = reply.status;
        job.end_time = Some(SystemTime::now());
        self.nodes.release(&from_node, reply.uid, reply.cpu_time);

        let compute_id = job.compute_id;
        let mut cleanup = None;
        if let Some(cluster) = self.clusters.get_mut(compute_id) {
            cluster.pending_jobs_count = cluster.pending_jobs_count.saturating_sub(1);
            cluster.touch(Instant::now());
            if let Some(stats) = cluster.dispy_nodes.get_mut(&from_node) {
                stats.jobs_run += 1;
                stats.cpu_time += reply.cpu_time;
            }
            if cluster.is_retirable() {
                cleanup = Some(compute_id);
            }
        }
        self.done_jobs.insert(reply.uid, job);

        if let Some(compute_id) = cleanup {
            // a DeliverReply intent still needs to go out first; the caller
            // is expected to also issue CleanupCluster once delivery
            // completes (handled by the net layer's result-delivery path).
            tracing::debug!(compute_id, "cluster eligible for cleanup after this reply");
        }
        Some(DispatchIntent::DeliverReply { compute_id, reply })
    }

    /// Reschedules every job a dead node was running. For reentrant
    /// clusters the job is requeued with a fresh hash; otherwise it's
    /// abandoned and a reply is returned for delivery.
    pub fn reschedule_jobs(&mut self, dead_job_uids: Vec<Uid>) -> Vec<JobReply> {
        let mut abandoned = Vec::new();
        for uid in dead_job_uids {
            let Some(mut job) = self.sched_jobs.remove(&uid) else {
                continue;
            };
            job.assigned_node = None;
            let reentrant = self
                .clusters
                .get(job.compute_id)
                .map(|c| c.reentrant)
                .unwrap_or(false);
            if reentrant {
                job.reschedule();
                if let Some(cluster) = self.clusters.get_mut(job.compute_id) {
                    cluster.jobs_queue.push_back(job);
                }
            } else {
                job.status = JobStatus::Abandoned;
                job.end_time = Some(SystemTime::now());
                let compute_id = job.compute_id;
                if let Some(cluster) = self.clusters.get_mut(compute_id) {
                    cluster.pending_jobs_count =
                        cluster.pending_jobs_count.saturating_sub(1);
                }
                abandoned.push(JobReply {
                    uid: job.uid,
                    compute_id,
                    hash: job.hash,
                    status: JobStatus::Abandoned,
                    cpu_time: 0.0,
                    payload: Vec::new(),
                });
                self.done_jobs.insert(uid, job);
            }
        }
        abandoned
    }

    /// Declares `ip` dead and reschedules everything it was running,
    /// whether triggered by a missed-pulse check or an explicit
    /// `TERMINATED:`. Also returns every cluster the node belonged to, so
    /// the caller can push a `Closed` node status to each one's client.
    pub fn node_died(&mut self, ip: IpAddr) -> (Vec<JobReply>, Vec<ComputeId>) {
        let Some(node) = self.nodes.mark_dead(&ip) else {
            return (Vec::new(), Vec::new());
        };
        let cluster_ids: Vec<ComputeId> = node.cluster_ids.iter().copied().collect();
        for cid in &cluster_ids {
            if let Some(cluster) = self.clusters.get_mut(*cid) {
                cluster.dispy_nodes.remove(&ip);
            }
        }
        let dead: Vec<Uid> = node.running_job_uids.into_iter().collect();
        (self.reschedule_jobs(dead), cluster_ids)
    }

    fn cluster_accepts_node(cluster: &Cluster, ip: IpAddr, port: u16, name: &str) -> bool {
        cluster.node_allocs.is_empty()
            || cluster.node_allocs.iter().any(|a| a.matches(&ip, port, name))
    }

    /// §4.6's `setup_node`: associates a freshly (re)discovered node with
    /// every cluster whose `node_allocs` accept it — pre-inserting it into
    /// `cluster.dispy_nodes` (the idempotency guard against a node being
    /// attached twice) and adding `compute_id` to `node.cluster_ids` so
    /// `pick` can see it as eligible. Returns the clusters the node was
    /// freshly attached to, for the caller to push an `Initialized` status.
    pub fn setup_node(&mut self, ip: IpAddr) -> Vec<ComputeId> {
        let Some(node) = self.nodes.lookup(&ip) else {
            return Vec::new();
        };
        let (port, name) = (node.port, node.name.clone());
        let mut attached = Vec::new();
        for cluster in self.clusters.iter_mut() {
            if cluster.dispy_nodes.contains_key(&ip) {
                continue;
            }
            if Self::cluster_accepts_node(cluster, ip, port, &name) {
                cluster.dispy_nodes.insert(ip, DispyNodeStats::default());
                attached.push(cluster.compute_id);
            }
        }
        if let Some(node) = self.nodes.lookup_mut(&ip) {
            for cid in &attached {
                node.cluster_ids.insert(*cid);
            }
        }
        attached
    }

    /// The other direction of `setup_node`: run when a cluster is created or
    /// gains a `node_alloc`, matching it against every already-discovered
    /// node instead of waiting for the next discovery round. Returns the
    /// node ips freshly attached, for the caller to push `Initialized`.
    pub fn setup_cluster(&mut self, compute_id: ComputeId) -> Vec<IpAddr> {
        let Some(cluster) = self.clusters.get(compute_id) else {
            return Vec::new();
        };
        let candidates: Vec<IpAddr> = self
            .nodes
            .iter()
            .filter(|n| !cluster.dispy_nodes.contains_key(&n.ip_addr))
            .filter(|n| Self::cluster_accepts_node(cluster, n.ip_addr, n.port, &n.name))
            .map(|n| n.ip_addr)
            .collect();

        let cluster = self.clusters.get_mut(compute_id).expect("checked above");
        for ip in &candidates {
            cluster.dispy_nodes.insert(*ip, DispyNodeStats::default());
        }
        for ip in &candidates {
            if let Some(node) = self.nodes.lookup_mut(ip) {
                node.cluster_ids.insert(compute_id);
            }
        }
        candidates
    }

    /// Applies a node rediscovery/restart, returning any jobs orphaned by a
    /// restart so the caller can `reschedule_jobs` them.
    pub fn upsert_node(&mut self, outcome: UpsertOutcome) -> Vec<Uid> {
        match outcome {
            UpsertOutcome::Restarted { dead_job_uids } => dead_job_uids,
            _ => Vec::new(),
        }
    }

    pub fn terminate_job(&mut self, compute_id: ComputeId, uid: Uid) -> TerminateOutcome {
        if self.done_jobs.contains_key(&uid) {
            return TerminateOutcome::AlreadyTerminal;
        }
        if let Some(cluster) = self.clusters.get_mut(compute_id) {
            if let Some(pos) = cluster.jobs_queue.iter().position(|j| j.uid == uid) {
                let mut job = cluster.jobs_queue.remove(pos).unwrap();
                job.status = JobStatus::Cancelled;
                job.end_time = Some(SystemTime::now());
                cluster.pending_jobs_count =
                    cluster.pending_jobs_count.saturating_sub(1);
                let reply = JobReply {
                    uid: job.uid,
                    compute_id,
                    hash: job.hash,
                    status: JobStatus::Cancelled,
                    cpu_time: 0.0,
                    payload: Vec::new(),
                };
                self.done_jobs.insert(uid, job);
                return TerminateOutcome::QueuedCancelled(reply);
            }
        }
        if let Some(job) = self.sched_jobs.get_mut(&uid) {
            if job.compute_id == compute_id {
                job.status = JobStatus::Cancelled;
                if let Some(ip) = job.assigned_node {
                    return TerminateOutcome::RunningNotifyNode(ip);
                }
            }
        }
        TerminateOutcome::NotFound
    }

    /// Drains every in-flight and queued job into `Terminated` replies, and
    /// zombifies every cluster, for a clean `shutdown()`.
    pub fn shutdown(&mut self) -> Vec<JobReply> {
        self.terminate = true;
        let mut replies = Vec::new();
        for (uid, job) in self.sched_jobs.drain() {
            replies.push(JobReply {
                uid,
                compute_id: job.compute_id,
                hash: job.hash,
                status: JobStatus::Terminated,
                cpu_time: 0.0,
                payload: Vec::new(),
            });
        }
        for cluster in self.clusters.iter_mut() {
            cluster.zombie_flag = true;
            while let Some(job) = cluster.jobs_queue.pop_front() {
                replies.push(JobReply {
                    uid: job.uid,
                    compute_id: job.compute_id,
                    hash: job.hash,
                    status: JobStatus::Terminated,
                    cpu_time: 0.0,
                    payload: Vec::new(),
                });
            }
        }
        replies
    }

    pub fn cluster_is_retirable(&self, compute_id: ComputeId) -> bool {
        self.clusters
            .get(compute_id)
            .map(Cluster::is_retirable)
            .unwrap_or(false)
    }

    /// A heartbeat from `ip`: refreshes the node's `last_pulse` and touches
    /// every cluster it's assigned to. A no-op if the node isn't registered.
    pub fn record_pulse(&mut self, ip: IpAddr) {
        let now = Instant::now();
        if let Some(cluster_ids) = self.nodes.record_pulse(&ip, now) {
            for cid in cluster_ids {
                if let Some(cluster) = self.clusters.get_mut(cid) {
                    cluster.touch(now);
                }
            }
        }
    }

    /// Declares any busy node whose last pulse is older than `pulse_timeout`
    /// dead, rescheduling or abandoning everything it was running. Also
    /// returns `(ip, compute_id)` pairs for every cluster a dead node
    /// belonged to, so the caller can push a `Closed` node status.
    pub fn pulse_sweep(&mut self, pulse_timeout: Duration) -> (Vec<JobReply>, Vec<(IpAddr, ComputeId)>) {
        let now = Instant::now();
        let dead_ips: Vec<IpAddr> = self
            .nodes
            .iter()
            .filter(|n| n.busy_count > 0 && now.duration_since(n.last_pulse) > pulse_timeout)
            .map(|n| n.ip_addr)
            .collect();
        let mut replies = Vec::new();
        let mut closed = Vec::new();
        for ip in dead_ips {
            tracing::warn!(%ip, "node missed pulse_timeout; declaring dead");
            let (r, cluster_ids) = self.node_died(ip);
            replies.extend(r);
            closed.extend(cluster_ids.into_iter().map(|cid| (ip, cid)));
        }
        (replies, closed)
    }

    /// Flags any cluster idle longer than `zombie_interval`, and returns the
    /// ids of every cluster (newly or already zombified) that's now fully
    /// drained and ready for `CleanupCluster`.
    pub fn zombie_sweep(&mut self, zombie_interval: Duration) -> Vec<ComputeId> {
        let now = Instant::now();
        let mut retirable = Vec::new();
        for cluster in self.clusters.iter_mut() {
            if now.duration_since(cluster.last_pulse) > zombie_interval {
                cluster.zombie_flag = true;
            }
            if cluster.is_retirable() {
                retirable.push(cluster.compute_id);
            }
        }
        retirable
    }

    /// For every cluster with a non-empty `node_allocs`, the allocations
    /// that don't yet match any node currently assigned to it — the set the
    /// ping sweep should re-probe.
    pub fn missing_allocations(&self) -> Vec<(ComputeId, Vec<NodeAllocation>)> {
        let mut out = Vec::new();
        for cluster in self.clusters.iter() {
            if cluster.node_allocs.is_empty() {
                continue;
            }
            let missing: Vec<NodeAllocation> = cluster
                .node_allocs
                .iter()
                .filter(|alloc| {
                    !self.nodes.iter().any(|n| {
                        n.cluster_ids.contains(&cluster.compute_id)
                            && alloc.matches(&n.ip_addr, n.port, &n.name)
                    })
                })
                .cloned()
                .collect();
            if !missing.is_empty() {
                out.push((cluster.compute_id, missing));
            }
        }
        out
    }

    /// What a timer tick needs from the engine: the ping-sweep targets and
    /// the clusters worth an opportunistic resend pass (spooled replies
    /// outstanding, not yet a zombie).
    pub fn tick_outcome(&self) -> TickOutcome {
        TickOutcome {
            missing_allocations: self.missing_allocations(),
            resend_candidates: self
                .clusters
                .iter()
                .filter(|c| c.pending_results_count > 0 && !c.zombie_flag)
                .map(|c| c.compute_id)
                .collect(),
        }
    }

    /// A reply that failed first-attempt delivery and was spooled to disk.
    pub fn reply_spooled(&mut self, compute_id: ComputeId) {
        if let Some(cluster) = self.clusters.get_mut(compute_id) {
            cluster.pending_results_count += 1;
        }
    }

    /// A terminal reply the net layer just confirmed delivered to the
    /// client: clears the scheduler's own record per §4.7 ("clear
    /// `done_jobs[uid]`") now that nothing downstream needs it. A no-op for
    /// a provisional reply's uid, which was never moved into `done_jobs`.
    pub fn reply_delivered(&mut self, uid: Uid) {
        self.done_jobs.remove(&uid);
    }

    /// A previously spooled reply that a resend pass successfully delivered.
    pub fn reply_resent(&mut self, compute_id: ComputeId) -> bool {
        if let Some(cluster) = self.clusters.get_mut(compute_id) {
            cluster.pending_results_count = cluster.pending_results_count.saturating_sub(1);
            return cluster.is_retirable();
        }
        false
    }

    /// `CLOSE:` from the client: zombifies the cluster immediately and
    /// reports whether it's already drained and ready for cleanup.
    pub fn close_cluster(&mut self, compute_id: ComputeId) -> bool {
        if let Some(cluster) = self.clusters.get_mut(compute_id) {
            cluster.zombie_flag = true;
            return cluster.is_retirable();
        }
        false
    }

    /// Checks a client-supplied `auth` against the cluster's own, returning
    /// its `dest_path` on success so the caller can act on it in one round
    /// trip instead of two.
    pub fn verify_cluster(&self, compute_id: ComputeId, auth: &str) -> Option<PathBuf> {
        self.clusters
            .get(compute_id)
            .filter(|c| c.client_auth == auth)
            .map(|c| c.dest_path.clone())
    }

    /// Every uid still tracked for `compute_id`, scheduled or queued —
    /// the scheduler-side bookkeeping a `NODE_JOBS:` reply draws from.
    pub fn list_cluster_jobs(&self, compute_id: ComputeId) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self
            .sched_jobs
            .values()
            .filter(|j| j.compute_id == compute_id)
            .map(|j| j.uid)
            .collect();
        if let Some(cluster) = self.clusters.get(compute_id) {
            uids.extend(cluster.jobs_queue.iter().map(|j| j.uid));
        }
        uids
    }

    /// `ALLOCATE_NODE:` from the client: appends a new allocation filter to
    /// the cluster, deduping on `ip_pattern` so a repeated request is a
    /// no-op.
    pub fn add_node_alloc(&mut self, compute_id: ComputeId, alloc: NodeAllocation) {
        if let Some(cluster) = self.clusters.get_mut(compute_id) {
            if !cluster.node_allocs.iter().any(|a| a.ip_pattern == alloc.ip_pattern) {
                cluster.node_allocs.push(alloc);
            }
        }
    }

    /// `SET_NODE_CPUS:`'s read side: the node's current `total_cpus` if
    /// it's assigned to `compute_id`, else `-1`.
    pub fn node_cpus(&self, compute_id: ComputeId, ip: IpAddr) -> i64 {
        match self.nodes.lookup(&ip) {
            Some(node) if node.cluster_ids.contains(&compute_id) => node.total_cpus as i64,
            _ => -1,
        }
    }

    /// `(pending_jobs_count, pending_results_count)` for `RESEND_JOB_RESULTS:`'s
    /// reply count.
    pub fn cluster_counts(&self, compute_id: ComputeId) -> Option<(usize, usize)> {
        self.clusters
            .get(compute_id)
            .map(|c| (c.pending_jobs_count, c.pending_results_count))
    }

    /// `ADD_CLUSTER:`'s read side: the cluster's destination directory, the
    /// transfer files it expects to find staged there, and the node
    /// allocations a fresh probe should target.
    pub fn cluster_probe_info(
        &self,
        compute_id: ComputeId,
    ) -> Option<(PathBuf, Vec<crate::cluster::StagedFileMeta>, Vec<NodeAllocation>)> {
        self.clusters.get(compute_id).map(|c| {
            (
                c.dest_path.clone(),
                c.expected_xfer_files.clone(),
                c.node_allocs.clone(),
            )
        })
    }

    /// A read-only snapshot of registry sizes: the periodic tracing log
    /// already taken by the timer service, and the same counters the
    /// optional HTTP dashboard reads. Never mutates anything.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            node_count: self.nodes.len(),
            live_cluster_count: self.clusters.iter().filter(|c| !c.zombie_flag).count(),
            zombie_cluster_count: self.clusters.iter().filter(|c| c.zombie_flag).count(),
            sched_jobs_count: self.sched_jobs.len(),
            spooled_replies_count: self
                .clusters
                .iter()
                .map(|c| c.pending_results_count)
                .sum(),
        }
    }
}

/// Read-only counters used by C11's periodic stats dump and by the optional
/// HTTP dashboard (C9's out-of-scope collaborator); carries no job or
/// cluster identity, just sizes.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineSnapshot {
    pub node_count: usize,
    pub live_cluster_count: usize,
    pub zombie_cluster_count: usize,
    pub sched_jobs_count: usize,
    pub spooled_replies_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ComputeSpec;
    use crate::config::Config;
    use crate::job::ScheduledJob;
    use crate::node::NodeInfo;
    use std::time::{Duration, Instant};

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            bind_addrs: vec!["0.0.0.0".parse().unwrap()],
            ext_addrs: vec![],
            node_specs: vec![],
            scheduler_port: 51347,
            node_port: 51348,
            command_port: 51349,
            node_secret: b"n".to_vec(),
            cluster_secret: b"c".to_vec(),
            pulse_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            zombie_interval: Duration::from_secs(3600),
            msg_timeout: Duration::from_secs(5),
            dest_path_prefix: dir.to_path_buf(),
            max_file_size: 0,
            clean_on_start: false,
            httpd: false,
            debug: false,
        }
    }

    async fn engine_with_cluster(reentrant: bool) -> (SchedulerEngine, ComputeId, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("sched_test_{}", rand::random::<u32>()));
        let config = test_config(&dir);
        let mut engine = SchedulerEngine::default();
        let compute = ComputeSpec {
            name: "sum".into(),
            reentrant,
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 9000,
            job_result_port: 9001,
            scheduler_port: 9002,
            dest_path: None,
            xfer_files: vec![],
            status_callback_endpoint: None,
        };
        let compute_id = engine
            .clusters
            .create(compute, vec![], "auth".into(), &config)
            .await
            .unwrap();
        (engine, compute_id, dir)
    }

    fn add_node(engine: &mut SchedulerEngine, ip: &str, cpus: usize, compute_id: ComputeId) {
        let info = NodeInfo {
            ip_addr: ip.parse().unwrap(),
            port: 51348,
            name: "n".into(),
            auth_token: "t".into(),
            total_cpus: cpus,
        };
        let ip_addr = info.ip_addr;
        engine.nodes.upsert(info, Instant::now());
        let attached = engine.setup_node(ip_addr);
        assert!(attached.contains(&compute_id), "setup_node should attach the node to its cluster");
    }

    #[tokio::test]
    async fn pick_and_dispatch_happy_path() {
        let (mut engine, compute_id, _dir) = engine_with_cluster(false).await;
        add_node(&mut engine, "10.0.0.5", 4, compute_id);
        engine
            .clusters
            .get_mut(compute_id)
            .unwrap()
            .enqueue(ScheduledJob::new(1, compute_id, vec![]));

        let (ip, uid) = engine.pick().expect("should pick a pair");
        assert_eq!(uid, 1);
        let job = engine.begin_dispatch(ip, uid).unwrap();
        assert_eq!(job.uid, 1);
        assert_eq!(engine.nodes.lookup(&ip).unwrap().busy_count, 1);

        engine.dispatch_succeeded(uid);
        assert_eq!(engine.sched_jobs.get(&uid).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn non_reentrant_job_is_abandoned_on_node_death() {
        let (mut engine, compute_id, _dir) = engine_with_cluster(false).await;
        add_node(&mut engine, "10.0.0.5", 4, compute_id);
        engine
            .clusters
            .get_mut(compute_id)
            .unwrap()
            .enqueue(ScheduledJob::new(1, compute_id, vec![]));
        let (ip, uid) = engine.pick().unwrap();
        engine.begin_dispatch(ip, uid).unwrap();

        let (replies, _) = engine.node_died(ip);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, JobStatus::Abandoned);
        assert!(!engine.sched_jobs.contains_key(&uid));
        assert_eq!(
            engine.clusters.get(compute_id).unwrap().pending_jobs_count,
            0
        );
    }

    #[tokio::test]
    async fn reentrant_job_is_requeued_with_new_hash_on_node_death() {
        let (mut engine, compute_id, _dir) = engine_with_cluster(true).await;
        add_node(&mut engine, "10.0.0.5", 4, compute_id);
        engine
            .clusters
            .get_mut(compute_id)
            .unwrap()
            .enqueue(ScheduledJob::new(1, compute_id, vec![]));
        let (ip, uid) = engine.pick().unwrap();
        let old_hash = engine.begin_dispatch(ip, uid).unwrap().hash;

        let (replies, _) = engine.node_died(ip);
        assert!(replies.is_empty());
        let requeued = &engine.clusters.get(compute_id).unwrap().jobs_queue[0];
        assert_ne!(requeued.hash, old_hash);
        assert_eq!(requeued.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn job_reply_rejects_stale_hash() {
        let (mut engine, compute_id, _dir) = engine_with_cluster(true).await;
        add_node(&mut engine, "10.0.0.5", 4, compute_id);
        engine
            .clusters
            .get_mut(compute_id)
            .unwrap()
            .enqueue(ScheduledJob::new(1, compute_id, vec![]));
        let (ip, uid) = engine.pick().unwrap();
        engine.begin_dispatch(ip, uid).unwrap();

        let bogus = JobReply {
            uid,
            compute_id,
            hash: crate::id::Hash(999999),
            status: JobStatus::Finished,
            cpu_time: 1.0,
            payload: vec![],
        };
        let intent = engine.handle_job_reply(ip, bogus);
        assert!(intent.is_none());
        assert!(engine.sched_jobs.contains_key(&uid));
    }

    #[tokio::test]
    async fn terminate_queued_job_cancels_immediately() {
        let (mut engine, compute_id, _dir) = engine_with_cluster(false).await;
        engine
            .clusters
            .get_mut(compute_id)
            .unwrap()
            .enqueue(ScheduledJob::new(5, compute_id, vec![]));

        let outcome = engine.terminate_job(compute_id, 5);
        assert!(matches!(outcome, TerminateOutcome::QueuedCancelled(_)));
        if let TerminateOutcome::QueuedCancelled(reply) = outcome {
            assert_eq!(reply.status, JobStatus::Cancelled);
            assert_eq!(reply.uid, 5);
        }
        assert_eq!(engine.done_jobs.get(&5).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_drains_sched_jobs_and_zombifies_clusters() {
        let (mut engine, compute_id, _dir) = engine_with_cluster(false).await;
        add_node(&mut engine, "10.0.0.5", 4, compute_id);
        engine
            .clusters
            .get_mut(compute_id)
            .unwrap()
            .enqueue(ScheduledJob::new(1, compute_id, vec![]));
        let (ip, uid) = engine.pick().unwrap();
        engine.begin_dispatch(ip, uid).unwrap();

        let replies = engine.shutdown();
        assert_eq!(replies.len(), 1);
        assert!(engine.sched_jobs.is_empty());
        assert!(engine.clusters.get(compute_id).unwrap().zombie_flag);
    }
}
