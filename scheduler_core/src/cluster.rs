//! Cluster registry (C2): tracks active computations (a client's batch of
//! jobs sharing code and transfer files), their queued/running jobs, client
//! endpoint, and on-disk destination. Owned exclusively by the
//! scheduler-loop task, same discipline as the node registry.
use crate::config::Config;
use crate::error::{Result, SchedulerError, StagingError};
use crate::id::{ComputeId, IdGen, Uid};
use crate::job::ScheduledJob;
use crate::HashMap;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Instant, SystemTime};
use tokio::io::AsyncWriteExt;

/// A filter over discovered nodes that a cluster may use. Evaluated
/// greedily: the first allocation whose predicate matches a node wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAllocation {
    pub ip_pattern: String,
    pub port: Option<u16>,
    pub max_cpus: Option<usize>,
    pub name_pattern: Option<String>,
}

impl NodeAllocation {
    /// A `*` anywhere in `ip_pattern` requests a broadcast probe rather than
    /// a unicast one.
    pub fn wants_broadcast(&self) -> bool {
        self.ip_pattern.contains('*')
    }

    pub fn matches(&self, ip: &IpAddr, port: u16, name: &str) -> bool {
        if let Some(want_port) = self.port {
            if want_port != port {
                return false;
            }
        }
        if !self.ip_pattern.contains('*') {
            if self.ip_pattern.parse::<IpAddr>().ok().as_ref() != Some(ip) {
                return false;
            }
        } else if let Ok(re) =
            Regex::new(&glob_to_regex(&self.ip_pattern))
        {
            if !re.is_match(&ip.to_string()) {
                return false;
            }
        }
        if let Some(pat) = &self.name_pattern {
            if let Ok(re) = Regex::new(&glob_to_regex(pat)) {
                if !re.is_match(name) {
                    return false;
                }
            }
        }
        true
    }
}

fn glob_to_regex(glob: &str) -> String {
    let escaped = regex::escape(glob).replace("\\*", ".*").replace("\\?", ".");
    format!("^{}$", escaped)
}

/// The client-submitted description of a computation, as received in the
/// `COMPUTE:` request. `job_result_port`/`scheduler_port` are rewritten by
/// `ClusterRegistry::create` so that nodes contact the scheduler, not the
/// client directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSpec {
    pub name: String,
    pub reentrant: bool,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub job_result_port: u16,
    pub scheduler_port: u16,
    pub dest_path: Option<PathBuf>,
    pub xfer_files: Vec<StagedFileMeta>,
    pub status_callback_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFileMeta {
    pub name: String,
    pub size: u64,
}

/// Per-node stats a cluster keeps about the nodes it's using, keyed by ip.
#[derive(Debug, Clone, Default)]
pub struct DispyNodeStats {
    pub jobs_run: u64,
    pub cpu_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub compute_id: ComputeId,
    pub client_auth: String,
    pub dest_path: PathBuf,
}

#[derive(Debug)]
pub struct Cluster {
    pub compute_id: ComputeId,
    pub client_auth: String,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub client_result_port: u16,
    pub node_allocs: Vec<NodeAllocation>,
    pub pending_jobs_count: usize,
    pub pending_results_count: usize,
    pub jobs_queue: VecDeque<ScheduledJob>,
    pub dispy_nodes: HashMap<IpAddr, DispyNodeStats>,
    /// The transfer files declared at `COMPUTE:` time, checked against
    /// `dest_path` by `ADD_CLUSTER:` before a probe is issued.
    pub expected_xfer_files: Vec<StagedFileMeta>,
    pub dest_path: PathBuf,
    pub last_pulse: Instant,
    pub zombie_flag: bool,
    pub reentrant: bool,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub status_callback_endpoint: Option<String>,
}

impl Cluster {
    pub fn is_retirable(&self) -> bool {
        self.zombie_flag && self.pending_jobs_count == 0 && self.pending_results_count == 0
    }

    /// Refreshes `last_pulse`: called on job submission, job replies, and a
    /// pulse from any node assigned to this cluster, so the zombie sweep
    /// only flags clusters with no activity of any kind.
    pub fn touch(&mut self, now: Instant) {
        self.last_pulse = now;
    }
}

#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: HashMap<ComputeId, Cluster>,
    ids: IdGen,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            clusters: HashMap::default(),
            ids: IdGen::new(),
        }
    }

    pub fn get(&self, compute_id: ComputeId) -> Option<&Cluster> {
        self.clusters.get(&compute_id)
    }

    pub fn get_mut(&mut self, compute_id: ComputeId) -> Option<&mut Cluster> {
        self.clusters.get_mut(&compute_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.clusters.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn retire(&mut self, compute_id: ComputeId) -> Option<Cluster> {
        self.clusters.remove(&compute_id)
    }

    /// Creates a new cluster: validates transfer file sizes, picks (or
    /// creates) a destination directory, rewrites the node-contact ports,
    /// and spools a snapshot so a reconnecting client can resume result
    /// retrieval even if the in-memory cluster survives only as long as the
    /// scheduler process does.
    pub async fn create(
        &mut self,
        mut compute: ComputeSpec,
        node_allocs: Vec<NodeAllocation>,
        client_auth: String,
        config: &Config,
    ) -> Result<ComputeId> {
        for f in &compute.xfer_files {
            if f.size > config.max_file_size && config.max_file_size > 0 {
                return Err(SchedulerError::Staging(StagingError::TooLarge {
                    name: f.name.clone(),
                    size: f.size,
                    max: config.max_file_size,
                }));
            }
        }

        let compute_id = self.ids.next();

        let dest_path = match &compute.dest_path {
            Some(p) if !p.as_os_str().is_empty() => p.clone(),
            _ => {
                let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
                config
                    .dest_path_prefix
                    .join(compute.client_ip.to_string())
                    .join(format!("{}_{}", compute.name, suffix))
            }
        };
        tokio::fs::create_dir_all(&dest_path).await?;
        compute.dest_path = Some(dest_path.clone());

        // the client's own job_result_port is where delivered replies go;
        // capture it before rewriting the field nodes are told to use.
        let client_result_port = compute.job_result_port;

        // rewrite contact ports so nodes reach the scheduler's node-facing
        // listener (C5), not the client
        compute.job_result_port = config.command_port;
        compute.scheduler_port = config.command_port;

        let snapshot = ClusterSnapshot {
            compute_id,
            client_auth: client_auth.clone(),
            dest_path: dest_path.clone(),
        };
        let snapshot_path = config
            .dest_path_prefix
            .join(format!("{}_{}", compute_id, client_auth));
        let bytes = serde_json::to_vec(&snapshot).expect("snapshot should serialize");
        let mut f = tokio::fs::File::create(&snapshot_path).await?;
        f.write_all(&bytes).await?;

        let cluster = Cluster {
            compute_id,
            client_auth,
            client_ip: compute.client_ip,
            client_port: compute.client_port,
            client_result_port,
            node_allocs,
            pending_jobs_count: 0,
            pending_results_count: 0,
            jobs_queue: VecDeque::new(),
            dispy_nodes: HashMap::default(),
            expected_xfer_files: compute.xfer_files.clone(),
            dest_path,
            last_pulse: Instant::now(),
            zombie_flag: false,
            reentrant: compute.reentrant,
            start_time: SystemTime::now(),
            end_time: None,
            status_callback_endpoint: compute.status_callback_endpoint,
        };
        self.clusters.insert(compute_id, cluster);
        Ok(compute_id)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl Cluster {
    pub fn nonempty_queue(&self) -> bool {
        !self.jobs_queue.is_empty()
    }

    /// Adds a job uid to the pending count, matching the invariant
    /// `pending_jobs_count = len(jobs_queue) + |sched_jobs for this cluster|`.
    pub fn enqueue(&mut self, job: ScheduledJob) {
        self.pending_jobs_count += 1;
        self.jobs_queue.push_back(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_allocation_matches_exact_ip() {
        let alloc = NodeAllocation {
            ip_pattern: "10.0.0.5".into(),
            port: None,
            max_cpus: None,
            name_pattern: None,
        };
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let other: IpAddr = "10.0.0.6".parse().unwrap();
        assert!(alloc.matches(&ip, 51348, "node1"));
        assert!(!alloc.matches(&other, 51348, "node1"));
    }

    #[test]
    fn node_allocation_wildcard_requests_broadcast() {
        let alloc = NodeAllocation {
            ip_pattern: "*".into(),
            port: None,
            max_cpus: None,
            name_pattern: None,
        };
        assert!(alloc.wants_broadcast());
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(alloc.matches(&ip, 51348, "anything"));
    }

    #[test]
    fn node_allocation_glob_ip_pattern() {
        let alloc = NodeAllocation {
            ip_pattern: "10.0.0.*".into(),
            port: None,
            max_cpus: None,
            name_pattern: None,
        };
        let ip: IpAddr = "10.0.0.42".parse().unwrap();
        let other: IpAddr = "10.0.1.42".parse().unwrap();
        assert!(alloc.matches(&ip, 51348, "n"));
        assert!(!alloc.matches(&other, 51348, "n"));
    }

    #[tokio::test]
    async fn create_rejects_oversized_transfer_file() {
        let mut reg = ClusterRegistry::new();
        let dir = tempdir();
        let config = test_config(&dir);
        let compute = ComputeSpec {
            name: "sum".into(),
            reentrant: false,
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 9000,
            job_result_port: 9001,
            scheduler_port: 9002,
            dest_path: None,
            xfer_files: vec![StagedFileMeta {
                name: "big.dat".into(),
                size: 1024,
            }],
            status_callback_endpoint: None,
        };
        let mut config = config;
        config.max_file_size = 100;
        let result = reg
            .create(compute, vec![], "client-auth".into(), &config)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn create_rewrites_ports_and_persists_snapshot() {
        let mut reg = ClusterRegistry::new();
        let dir = tempdir();
        let config = test_config(&dir);
        let compute = ComputeSpec {
            name: "sum".into(),
            reentrant: true,
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 9000,
            job_result_port: 12345,
            scheduler_port: 12346,
            dest_path: None,
            xfer_files: vec![],
            status_callback_endpoint: None,
        };
        let compute_id = reg
            .create(compute, vec![], "client-auth".into(), &config)
            .await
            .unwrap();
        let cluster = reg.get(compute_id).unwrap();
        // the client's original job_result_port is preserved for delivery...
        assert_eq!(cluster.client_result_port, 12345);
        assert!(cluster.dest_path.exists());

        let snapshot_path = config
            .dest_path_prefix
            .join(format!("{}_{}", compute_id, "client-auth"));
        assert!(snapshot_path.exists());
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        let suffix: u32 = rand::thread_rng().gen_range(0..u32::MAX);
        p.push(format!("scheduler_core_test_{}", suffix));
        p
    }

    fn test_config(dir: &PathBuf) -> Config {
        use std::time::Duration;
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
            dest_path_prefix: dir.clone(),
            max_file_size: 0,
            clean_on_start: false,
            httpd: false,
            debug: false,
        }
    }
}
