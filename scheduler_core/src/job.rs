//! The job model, split into two closed record types instead of one object
//! that grows fields as it moves through its lifecycle: `ScheduledJob` is
//! the scheduler's internal record (uid, hash, assigned node), `JobView` is
//! the client-visible projection (id, status, start/end time) sent back over
//! the wire.
use crate::id::{ComputeId, Hash, Uid};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Running,
    /// Non-terminal: a partial/intermediate result forwarded through to the
    /// client without releasing the job's scheduler-side bookkeeping.
    ProvisionalResult,
    Finished,
    Terminated,
    Cancelled,
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Created | JobStatus::Running | JobStatus::ProvisionalResult)
    }
}

/// A staged transfer file reference, rewritten to live under the cluster's
/// `dest_path` before the job is ever queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XferFile {
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
}

/// The scheduler's internal job record. Created on `JOB:`, owned by the
/// cluster's `jobs_queue` while unscheduled, then by `sched_jobs` once
/// dispatched, then by `done_jobs` after a terminal reply, until delivery.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub uid: Uid,
    pub compute_id: ComputeId,
    pub hash: Hash,
    pub xfer_files: Vec<XferFile>,
    pub assigned_node: Option<IpAddr>,
    pub status: JobStatus,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

impl ScheduledJob {
    pub fn new(uid: Uid, compute_id: ComputeId, xfer_files: Vec<XferFile>) -> Self {
        ScheduledJob {
            uid,
            compute_id,
            hash: Hash::fresh(),
            xfer_files,
            assigned_node: None,
            status: JobStatus::Created,
            start_time: None,
            end_time: None,
        }
    }

    /// Rotates to a fresh hash and resets to `Created`, in place for a
    /// reschedule; any in-flight reply bearing the old hash is rejected by
    /// the node-reply handler.
    pub fn reschedule(&mut self) {
        self.hash = Hash::fresh();
        self.assigned_node = None;
        self.status = JobStatus::Created;
        self.start_time = None;
        self.end_time = None;
    }

    pub fn view(&self) -> JobView {
        JobView {
            uid: self.uid,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// The client-visible view of a job, sent as part of `JOB_STATUS` updates
/// and terminal replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub uid: Uid,
    pub status: JobStatus,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reschedule_rotates_hash_and_resets_status() {
        let mut job = ScheduledJob::new(1, 100, vec![]);
        job.status = JobStatus::Running;
        job.assigned_node = Some("10.0.0.1".parse().unwrap());
        let old_hash = job.hash;

        job.reschedule();

        assert_ne!(job.hash, old_hash);
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.assigned_node.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Abandoned.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Terminated.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::ProvisionalResult.is_terminal());
    }
}
