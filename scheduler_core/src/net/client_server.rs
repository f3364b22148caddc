//! Client-facing connections (C4): a handshake that hands the client our
//! identity and sign so it can derive its auth, then a loop of authenticated
//! `ClientRequest`s over that same connection. A file upload takes the same
//! listener but a different first frame (`ClientConnKind::FileXfer`) and a
//! connection of its own, one per file, mirroring how every other outbound
//! operation in this crate is a fresh connection rather than a shared one.
use crate::auth;
use crate::config::Config;
use crate::error::{Result, SchedulerError};
use crate::id::ComputeId;
use crate::job::XferFile;
use crate::net::EngineHandle;
use crate::scheduler::TerminateOutcome;
use crate::staging;
use crate::wire::{
    ClientConnKind, ClientHello, ClientReply, ClientRequest, Connection, FileXferRequest,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::net::{TcpListener, TcpStream};

/// Accepts client connections on `bind_addr` forever, dispatching each to
/// either the request/reply loop or a one-shot file upload depending on its
/// first frame.
pub async fn run_client_listener(
    bind_addr: SocketAddr,
    config: Config,
    our_sign: Vec<u8>,
    handle: EngineHandle,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "client protocol listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        let our_sign = our_sign.clone();
        let handle = handle.clone();
        crate::net::spawn("client-conn", async move {
            if let Err(e) = handle_client_connection(stream, peer, &config, &our_sign, &handle).await
            {
                tracing::debug!(%peer, error = %e, "client connection ended");
            }
        });
    }
}

async fn handle_client_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: &Config,
    our_sign: &[u8],
    handle: &EngineHandle,
) -> Result<()> {
    let mut conn = Connection::new(stream);
    let Some(kind) = conn.recv::<ClientConnKind>().await else {
        return Err(SchedulerError::ConnectionClosed);
    };

    match kind {
        ClientConnKind::FileXfer(req) => handle_filexfer(conn, req, config, handle).await,
        ClientConnKind::Hello(hello) => {
            handle_request_session(conn, hello, peer, config, our_sign, handle).await
        }
    }
}

async fn handle_request_session(
    mut conn: Connection<TcpStream>,
    hello: ClientHello,
    peer: SocketAddr,
    config: &Config,
    our_sign: &[u8],
    handle: &EngineHandle,
) -> Result<()> {
    if hello.version != PROTOCOL_VERSION {
        tracing::warn!(%peer, theirs = %hello.version, "client protocol version mismatch");
        let _ = conn
            .send(&ClientReply::Error(format!(
                "version mismatch: scheduler runs {}, client sent {}",
                PROTOCOL_VERSION, hello.version
            )))
            .await;
        return Err(SchedulerError::VersionMismatch {
            ours: PROTOCOL_VERSION.to_string(),
            theirs: hello.version,
        });
    }

    // Hand back our own identity so the client can derive
    // `auth_code(cluster_secret, our_sign)` independently; we derive the
    // same value here and use it as the `client_auth` for a fresh `Compute`.
    let our_hello = ClientHello {
        ip_addr: config.ext_addrs.first().copied().unwrap_or(peer.ip()),
        port: config.scheduler_port,
        sign: our_sign.to_vec(),
        version: PROTOCOL_VERSION.to_string(),
    };
    conn.send(&our_hello).await?;

    let bootstrap_auth = auth::auth_code(&config.cluster_secret, our_sign);

    while let Some(req) = conn.recv::<ClientRequest>().await {
        let reply = handle_request(req, &bootstrap_auth, config, our_sign, handle).await;
        conn.send(&reply).await?;
    }
    Ok(())
}

async fn handle_filexfer(
    conn: Connection<TcpStream>,
    req: FileXferRequest,
    config: &Config,
    handle: &EngineHandle,
) -> Result<()> {
    let Some(dest_path) = handle.verify_cluster(req.compute_id, req.auth.clone()).await else {
        tracing::debug!(compute_id = req.compute_id, "filexfer auth rejected");
        return Err(SchedulerError::BadAuth);
    };

    let mut raw = conn.into_inner();
    let result = staging::stage_file(&dest_path, &req.meta, config.max_file_size, &mut raw).await;
    staging::send_ack(&mut raw, result.is_ok()).await?;
    if let Err(e) = result {
        tracing::warn!(compute_id = req.compute_id, name = %req.meta.name, error = %e, "filexfer failed");
    }
    Ok(())
}

async fn handle_request(
    req: ClientRequest,
    bootstrap_auth: &str,
    config: &Config,
    our_sign: &[u8],
    handle: &EngineHandle,
) -> ClientReply {
    match req {
        ClientRequest::Compute { compute, node_allocs } => {
            match handle
                .create_cluster(compute, node_allocs, bootstrap_auth.to_string())
                .await
            {
                Ok(compute_id) => ClientReply::ComputeCreated {
                    compute_id,
                    pulse_interval_secs: config.pulse_interval.as_secs(),
                    job_result_port: config.scheduler_port,
                },
                Err(e) => ClientReply::Error(e.to_string()),
            }
        }

        ClientRequest::AddCluster { compute_id, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            let Some((dest_path, expected, node_allocs)) =
                handle.cluster_probe_info(compute_id).await
            else {
                return ClientReply::Error("unknown compute_id".into());
            };
            if let Some(missing) = first_missing_xfer_file(&dest_path, &expected).await {
                return ClientReply::Error(format!("staged file missing: {}", missing));
            }
            if !node_allocs.is_empty() {
                let specs: Vec<crate::net::discovery::NodeSpec> = node_allocs
                    .iter()
                    .map(|a| crate::net::discovery::NodeSpec {
                        ip_pattern: a.ip_pattern.clone(),
                        port: a.port,
                    })
                    .collect();
                let ext_addrs = config.ext_addrs.clone();
                let scheduler_port = config.scheduler_port;
                let node_port = config.node_port;
                let sign = our_sign.to_vec();
                crate::net::spawn("add-cluster-probe", async move {
                    if let Err(e) = crate::net::discovery::send_pings(
                        &specs,
                        &ext_addrs,
                        scheduler_port,
                        node_port,
                        &sign,
                    )
                    .await
                    {
                        tracing::warn!(compute_id, error = %e, "ADD_CLUSTER: probe failed to send");
                    }
                });
            }
            ClientReply::Ok
        }

        ClientRequest::Job { job } => {
            let Some(_) = verify(handle, job.compute_id, job.auth).await else {
                return auth_error();
            };
            let now = SystemTime::now();
            let xfer_files: Vec<XferFile> = job
                .xfer_files
                .into_iter()
                .map(|f| XferFile { name: f.name, size: f.size, mtime: now })
                .collect();
            match handle.submit_job(job.compute_id, xfer_files).await {
                Some(uid) => ClientReply::Uid(uid),
                None => ClientReply::Error("unknown compute_id".into()),
            }
        }

        ClientRequest::Close { compute_id, auth } => match verify(handle, compute_id, auth).await {
            Some(_) => {
                handle.close_cluster(compute_id).await;
                ClientReply::Ok
            }
            None => auth_error(),
        },

        ClientRequest::TerminateJob { compute_id, uid, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            match handle.terminate_job(compute_id, uid).await {
                TerminateOutcome::QueuedCancelled(_)
                | TerminateOutcome::RunningNotifyNode(_)
                // a racing cancel against a job that already finished is not
                // an error: the client gets the success it asked for either way.
                | TerminateOutcome::AlreadyTerminal => ClientReply::Ok,
                TerminateOutcome::NotFound => ClientReply::Error("unknown job uid".into()),
            }
        }

        ClientRequest::NodeJobs { compute_id, node: _, from_node: _, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            // `from_node=true` would query the node directly; this crate
            // only reports the scheduler's own bookkeeping for the cluster.
            ClientReply::Uids(handle.list_cluster_jobs(compute_id).await)
        }

        ClientRequest::ResendJobResults { compute_id, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            let (pending_jobs, pending_results) =
                handle.cluster_counts(compute_id).await.unwrap_or((0, 0));
            if pending_results > 0 {
                let owned_handle = EngineHandle::clone(handle);
                crate::net::spawn("resend-on-request", async move {
                    crate::net::node_server::resend_pending(compute_id, &owned_handle).await;
                });
            }
            ClientReply::Count(pending_jobs + pending_results)
        }

        ClientRequest::PendingJobs { compute_id, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            let (done, pending) = handle.pending_jobs(compute_id).await;
            ClientReply::PendingJobsReport { done, pending }
        }

        ClientRequest::RetrieveJob { uid, compute_id, auth, hash } => {
            let Some(dest_path) = verify(handle, compute_id, auth).await else {
                return auth_error();
            };
            match crate::delivery::load_spooled(&dest_path, uid).await {
                Some(reply) if reply.hash == hash => {
                    let _ = crate::delivery::delete_spooled(&dest_path, uid).await;
                    handle.reply_resent(compute_id).await;
                    ClientReply::JobReplyPayload(Some(reply))
                }
                _ => ClientReply::JobReplyPayload(None),
            }
        }

        ClientRequest::AllocateNode { compute_id, node_alloc, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            handle.add_node_alloc(compute_id, node_alloc).await;
            ClientReply::Count(0)
        }

        ClientRequest::SetNodeCpus { compute_id, node, auth } => {
            if verify(handle, compute_id, auth).await.is_none() {
                return auth_error();
            }
            ClientReply::Cpus(handle.node_cpus(compute_id, node).await)
        }
    }
}

async fn verify(
    handle: &EngineHandle,
    compute_id: ComputeId,
    auth: String,
) -> Option<std::path::PathBuf> {
    handle.verify_cluster(compute_id, auth).await
}

fn auth_error() -> ClientReply {
    ClientReply::Error("bad cluster auth".into())
}

/// `ADD_CLUSTER:`'s file-validation step: every file the client declared at
/// `COMPUTE:` time must already be staged under the cluster's `dest_path`.
/// Returns the name of the first one that isn't.
async fn first_missing_xfer_file(
    dest_path: &std::path::Path,
    expected: &[crate::cluster::StagedFileMeta],
) -> Option<String> {
    for meta in expected {
        let Ok(path) = staging::resolve_dest(dest_path, &meta.name) else {
            return Some(meta.name.clone());
        };
        if tokio::fs::metadata(&path).await.is_err() {
            return Some(meta.name.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ComputeSpec;
    use crate::policy::LoadBalance;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            bind_addrs: vec!["0.0.0.0".parse().unwrap()],
            ext_addrs: vec![],
            node_specs: vec![],
            scheduler_port: 0,
            node_port: 0,
            command_port: 0,
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

    fn sample_compute() -> ComputeSpec {
        ComputeSpec {
            name: "sum".into(),
            reentrant: false,
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 9000,
            job_result_port: 9001,
            scheduler_port: 9002,
            dest_path: None,
            xfer_files: vec![],
            status_callback_endpoint: None,
        }
    }

    #[tokio::test]
    async fn compute_request_creates_a_cluster_and_replies_with_its_contact_info() {
        let dir = std::env::temp_dir().join(format!("client_server_test_{}", rand::random::<u32>()));
        let config = test_config(&dir);
        let (handle, _intents) = crate::net::spawn_engine(config.clone(), Box::new(LoadBalance));

        let reply = handle_request(
            ClientRequest::Compute { compute: sample_compute(), node_allocs: vec![] },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;

        match reply {
            ClientReply::ComputeCreated { pulse_interval_secs, job_result_port, .. } => {
                assert_eq!(pulse_interval_secs, 10);
                assert_eq!(job_result_port, config.scheduler_port);
            }
            other => panic!("expected ComputeCreated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn job_request_with_wrong_auth_is_rejected() {
        let dir = std::env::temp_dir().join(format!("client_server_test_{}", rand::random::<u32>()));
        let config = test_config(&dir);
        let (handle, _intents) = crate::net::spawn_engine(config.clone(), Box::new(LoadBalance));

        let created = handle_request(
            ClientRequest::Compute { compute: sample_compute(), node_allocs: vec![] },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        let ClientReply::ComputeCreated { compute_id, .. } = created else {
            panic!("setup failed");
        };

        let reply = handle_request(
            ClientRequest::Job {
                job: crate::wire::JobSubmission {
                    compute_id,
                    auth: "wrong-auth".into(),
                    xfer_files: vec![],
                },
            },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        assert!(matches!(reply, ClientReply::Error(_)));
    }

    #[tokio::test]
    async fn job_request_with_correct_auth_is_queued() {
        let dir = std::env::temp_dir().join(format!("client_server_test_{}", rand::random::<u32>()));
        let config = test_config(&dir);
        let (handle, _intents) = crate::net::spawn_engine(config.clone(), Box::new(LoadBalance));

        let created = handle_request(
            ClientRequest::Compute { compute: sample_compute(), node_allocs: vec![] },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        let ClientReply::ComputeCreated { compute_id, .. } = created else {
            panic!("setup failed");
        };

        let reply = handle_request(
            ClientRequest::Job {
                job: crate::wire::JobSubmission {
                    compute_id,
                    auth: "bootstrap-auth".into(),
                    xfer_files: vec![],
                },
            },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        assert!(matches!(reply, ClientReply::Uid(_)));
    }

    #[tokio::test]
    async fn add_cluster_rejects_when_a_declared_xfer_file_is_not_yet_staged() {
        let dir = std::env::temp_dir().join(format!("client_server_test_{}", rand::random::<u32>()));
        let config = test_config(&dir);
        let (handle, _intents) = crate::net::spawn_engine(config.clone(), Box::new(LoadBalance));

        let mut compute = sample_compute();
        compute.xfer_files = vec![crate::cluster::StagedFileMeta { name: "input.dat".into(), size: 4 }];
        let created = handle_request(
            ClientRequest::Compute { compute, node_allocs: vec![] },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        let ClientReply::ComputeCreated { compute_id, .. } = created else {
            panic!("setup failed");
        };

        let reply = handle_request(
            ClientRequest::AddCluster { compute_id, auth: "bootstrap-auth".into() },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        assert!(matches!(reply, ClientReply::Error(_)));
    }

    #[tokio::test]
    async fn add_cluster_succeeds_once_every_declared_file_is_staged() {
        let dir = std::env::temp_dir().join(format!("client_server_test_{}", rand::random::<u32>()));
        let config = test_config(&dir);
        let (handle, _intents) = crate::net::spawn_engine(config.clone(), Box::new(LoadBalance));

        let mut compute = sample_compute();
        compute.xfer_files = vec![crate::cluster::StagedFileMeta { name: "input.dat".into(), size: 4 }];
        let created = handle_request(
            ClientRequest::Compute { compute, node_allocs: vec![] },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        let ClientReply::ComputeCreated { compute_id, .. } = created else {
            panic!("setup failed");
        };

        let Some((dest_path, _, _)) = handle.cluster_probe_info(compute_id).await else {
            panic!("cluster not found");
        };
        tokio::fs::create_dir_all(&dest_path).await.unwrap();
        tokio::fs::write(dest_path.join("input.dat"), b"data").await.unwrap();

        let reply = handle_request(
            ClientRequest::AddCluster { compute_id, auth: "bootstrap-auth".into() },
            "bootstrap-auth",
            &config,
            b"sign",
            &handle,
        )
        .await;
        assert!(matches!(reply, ClientReply::Ok));
    }
}
