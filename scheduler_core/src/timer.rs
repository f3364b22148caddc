//! The timer service (C8): a single periodic task, ticking at
//! `min(pulse_interval, ping_interval, zombie_interval)`, that drives the
//! dead-node pulse check, the cluster zombie sweep, and a re-discovery ping
//! sweep against any cluster still missing allocated nodes. The engine does
//! the bookkeeping (it owns no sockets); this task fires the actual UDP
//! pings and resend attempts the engine's tick hands back.
use crate::config::Config;
use crate::net::discovery::{self, NodeSpec};
use crate::net::node_server;
use crate::net::EngineHandle;

/// Runs forever on `config.timer_tick()`. `our_sign` is the same value used
/// for the initial discovery broadcast, so re-pings during the ping sweep
/// are indistinguishable from the scheduler's original probe.
pub async fn run(config: Config, our_sign: Vec<u8>, handle: EngineHandle) {
    let mut interval = tokio::time::interval(config.timer_tick());
    loop {
        interval.tick().await;
        let outcome = handle.tick().await;

        let snapshot = handle.snapshot().await;
        tracing::info!(
            nodes = snapshot.node_count,
            live_clusters = snapshot.live_cluster_count,
            zombie_clusters = snapshot.zombie_cluster_count,
            sched_jobs = snapshot.sched_jobs_count,
            spooled_replies = snapshot.spooled_replies_count,
            "timer tick"
        );

        for (compute_id, allocs) in outcome.missing_allocations {
            let specs: Vec<NodeSpec> = allocs
                .iter()
                .map(|a| NodeSpec { ip_pattern: a.ip_pattern.clone(), port: a.port })
                .collect();
            tracing::debug!(compute_id, count = specs.len(), "ping sweep: re-probing missing allocations");
            if let Err(e) = discovery::send_pings(
                &specs,
                &config.ext_addrs,
                config.scheduler_port,
                config.node_port,
                &our_sign,
            )
            .await
            {
                tracing::warn!(compute_id, error = %e, "ping sweep failed to send");
            }
        }

        for compute_id in outcome.resend_candidates {
            node_server::resend_pending(compute_id, &handle).await;
        }
    }
}
