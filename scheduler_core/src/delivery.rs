//! Result delivery (C7): sends replies back to the originating client and,
//! on failure, spools them to disk for later pickup.
use crate::wire::{Ack, ClientDelivery, Connection, JobReply};
use crate::id::Uid;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

const SPOOL_PREFIX: &str = "_dispy_job_reply_";
/// Cap on how many spooled replies are resent in a single best-effort pass,
/// whether triggered by an explicit `RESEND_JOB_RESULTS:` or a pulse sweep.
pub const RESEND_BATCH_CAP: usize = 64;
/// Cap on how many spooled uids `PENDING_JOBS:` reports at once.
pub const PENDING_JOBS_REPORT_CAP: usize = 50;

fn spool_path(dest_path: &Path, uid: Uid) -> PathBuf {
    dest_path.join(format!("{}{}", SPOOL_PREFIX, uid))
}

/// Attempts to send `reply` over an already-connected channel to the
/// client, expecting an `Ack` back. Returns `Ok(true)` if acked, `Ok(false)`
/// if the peer replied but not with an ack, `Err` on any I/O/framing
/// failure (treated identically to a failed connection by the caller).
pub async fn send_over<S>(
    conn: &mut Connection<S>,
    reply: &JobReply,
) -> crate::error::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&ClientDelivery::Reply(reply.clone())).await?;
    match conn.recv::<Ack>().await {
        Some(Ack::Ack) => Ok(true),
        Some(Ack::Nak) => Ok(false),
        None => Err(crate::error::SchedulerError::ConnectionClosed),
    }
}

/// Spools `reply` to `<dest_path>/_dispy_job_reply_<uid>` so a disconnected
/// client can retrieve it later via `RETRIEVE_JOB:` or a pulse-triggered
/// resend.
pub async fn spool(dest_path: &Path, reply: &JobReply) -> std::io::Result<()> {
    let path = spool_path(dest_path, reply.uid);
    let bytes =
        bincode::serialize(reply).expect("JobReply should always serialize");
    tokio::fs::write(path, bytes).await
}

pub async fn load_spooled(dest_path: &Path, uid: Uid) -> Option<JobReply> {
    let bytes = tokio::fs::read(spool_path(dest_path, uid)).await.ok()?;
    bincode::deserialize(&bytes).ok()
}

pub async fn delete_spooled(dest_path: &Path, uid: Uid) -> std::io::Result<()> {
    match tokio::fs::remove_file(spool_path(dest_path, uid)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Lists up to `limit` spooled reply uids under `dest_path`, for
/// `PENDING_JOBS:` and resend passes.
pub async fn list_spooled(dest_path: &Path, limit: usize) -> Vec<Uid> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dest_path).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if out.len() >= limit {
            break;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some(suffix) = name.strip_prefix(SPOOL_PREFIX) {
                if let Ok(uid) = suffix.parse::<Uid>() {
                    out.push(uid);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Hash;
    use crate::job::JobStatus;

    fn sample_reply(uid: Uid) -> JobReply {
        JobReply {
            uid,
            compute_id: 1,
            hash: Hash(42),
            status: JobStatus::Finished,
            cpu_time: 1.0,
            payload: vec![1, 2, 3],
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("delivery_test_{}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn spool_then_load_round_trips() {
        let dir = tempdir();
        let reply = sample_reply(7);
        spool(&dir, &reply).await.unwrap();

        let loaded = load_spooled(&dir, 7).await.unwrap();
        assert_eq!(loaded.uid, 7);
        assert_eq!(loaded.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delete_spooled_is_idempotent() {
        let dir = tempdir();
        let reply = sample_reply(9);
        spool(&dir, &reply).await.unwrap();
        delete_spooled(&dir, 9).await.unwrap();
        // deleting again should not error
        delete_spooled(&dir, 9).await.unwrap();
        assert!(load_spooled(&dir, 9).await.is_none());
    }

    #[tokio::test]
    async fn list_spooled_respects_cap() {
        let dir = tempdir();
        for uid in 0..10 {
            spool(&dir, &sample_reply(uid)).await.unwrap();
        }
        let listed = list_spooled(&dir, 5).await;
        assert_eq!(listed.len(), 5);
    }
}
