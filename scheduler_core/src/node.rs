//! Node registry (C1): tracks discovered nodes, their CPU capacity, busy
//! count, liveness and auth. Owned exclusively by the scheduler-loop task —
//! no internal locking.
use crate::id::{ComputeId, Uid};
use crate::HashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

/// A node-status push to a client's `status_callback_endpoint`, distinct
/// from a job's own status: `Initialized` fires once `setup_node` attaches a
/// node to a cluster, `Closed` once the pulse check declares it dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatusKind {
    Initialized,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusView {
    pub ip_addr: IpAddr,
    pub status: NodeStatusKind,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ip_addr: IpAddr,
    pub port: u16,
    pub name: String,
    pub auth_token: String,
    pub total_cpus: usize,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub ip_addr: IpAddr,
    pub port: u16,
    pub name: String,
    pub auth_token: String,
    pub total_cpus: usize,
    pub avail_cpus: usize,
    pub busy_count: usize,
    pub last_pulse: Instant,
    pub cluster_ids: HashSet<ComputeId>,
    pub running_job_uids: HashSet<Uid>,
    pub cpu_time_accum: f64,
    pub jobs_completed: u64,
}

impl Node {
    fn from_info(info: NodeInfo, now: Instant) -> Self {
        Node {
            ip_addr: info.ip_addr,
            port: info.port,
            name: info.name,
            auth_token: info.auth_token,
            total_cpus: info.total_cpus,
            avail_cpus: info.total_cpus,
            busy_count: 0,
            last_pulse: now,
            cluster_ids: HashSet::default(),
            running_job_uids: HashSet::default(),
            cpu_time_accum: 0.0,
            jobs_completed: 0,
        }
    }

    /// `busy_count < total_cpus` with at least one free slot.
    pub fn has_free_slot(&self) -> bool {
        self.busy_count < self.total_cpus
    }

    pub fn load_fraction(&self) -> f64 {
        if self.total_cpus == 0 {
            1.0
        } else {
            self.busy_count as f64 / self.total_cpus as f64
        }
    }

    /// Average accumulated CPU time per completed job; zero-job nodes sort
    /// as 0, so the `fast_node` policy prefers fresh nodes.
    pub fn avg_cpu_time(&self) -> f64 {
        if self.jobs_completed == 0 {
            0.0
        } else {
            self.cpu_time_accum / self.jobs_completed as f64
        }
    }
}

/// Outcome of an `upsert`: whether the node was newly created, a no-op
/// refresh, or a restart that orphaned a set of running jobs.
#[derive(Debug)]
pub enum UpsertOutcome {
    New,
    Refreshed,
    Restarted { dead_job_uids: Vec<Uid> },
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<IpAddr, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<&Node> {
        self.nodes.get(ip)
    }

    pub fn lookup_mut(&mut self, ip: &IpAddr) -> Option<&mut Node> {
        self.nodes.get_mut(ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records a successful handshake with `info`. Matching `(port,
    /// auth_token)` against the existing entry is a no-op refresh;
    /// otherwise the previous incarnation's running jobs become dead and
    /// must be rescheduled by the caller.
    pub fn upsert(&mut self, info: NodeInfo, now: Instant) -> UpsertOutcome {
        match self.nodes.get_mut(&info.ip_addr) {
            None => {
                self.nodes.insert(info.ip_addr, Node::from_info(info, now));
                UpsertOutcome::New
            }
            Some(existing) => {
                if existing.port == info.port
                    && existing.auth_token == info.auth_token
                {
                    existing.last_pulse = now;
                    existing.total_cpus = info.total_cpus;
                    UpsertOutcome::Refreshed
                } else {
                    let dead_job_uids: Vec<Uid> =
                        existing.running_job_uids.drain().collect();
                    let cluster_ids = existing.cluster_ids.clone();
                    let mut fresh = Node::from_info(info, now);
                    fresh.cluster_ids = cluster_ids;
                    self.nodes.insert(fresh.ip_addr, fresh);
                    UpsertOutcome::Restarted { dead_job_uids }
                }
            }
        }
    }

    /// Declares a node dead (missed pulses or explicit TERMINATED), removing
    /// it from the registry and returning its last-known state so the
    /// caller can reschedule its running jobs.
    pub fn mark_dead(&mut self, ip: &IpAddr) -> Option<Node> {
        self.nodes.remove(ip)
    }

    /// Marks one CPU slot as assigned to `uid`. Panics if the node has no
    /// free slot — callers must check `has_free_slot` first, since the
    /// scheduler loop only dispatches to nodes it just selected for having
    /// one. `busy_count` must never exceed `total_cpus`.
    pub fn assign(&mut self, ip: &IpAddr, uid: Uid) {
        if let Some(node) = self.nodes.get_mut(ip) {
            assert!(node.has_free_slot(), "dispatch onto a saturated node");
            node.busy_count += 1;
            node.running_job_uids.insert(uid);
        }
    }

    /// Releases the CPU slot `uid` held, accumulating `cpu_time` into the
    /// node's running average for the `fast_node` policy.
    pub fn release(&mut self, ip: &IpAddr, uid: Uid, cpu_time: f64) {
        if let Some(node) = self.nodes.get_mut(ip) {
            if node.running_job_uids.remove(&uid) {
                node.busy_count = node.busy_count.saturating_sub(1);
                node.cpu_time_accum += cpu_time;
                node.jobs_completed += 1;
            }
        }
    }

    pub fn discard_uid(&mut self, ip: &IpAddr, uid: Uid) {
        if let Some(node) = self.nodes.get_mut(ip) {
            node.running_job_uids.remove(&uid);
        }
    }

    /// Refreshes `last_pulse` for a node heartbeat, returning the clusters
    /// it belongs to so the caller can touch their liveness too. `None` if
    /// the node isn't registered (a pulse from a node we never discovered).
    pub fn record_pulse(&mut self, ip: &IpAddr, now: Instant) -> Option<HashSet<ComputeId>> {
        let node = self.nodes.get_mut(ip)?;
        node.last_pulse = now;
        Some(node.cluster_ids.clone())
    }
}
