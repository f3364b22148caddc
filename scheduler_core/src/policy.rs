//! Placement policies. Pluggable behind the `Policy` trait; `load_balance`
//! is the default.
use crate::node::{Node, NodeRegistry};
use std::net::IpAddr;

/// Picks the best eligible node to dispatch onto next, where "eligible"
/// means it has a free CPU slot and at least one of its clusters
/// (`is_eligible_cluster`) has a nonempty job queue. Returns `None` if no
/// node qualifies.
///
/// This scan is O(nodes x clusters) per tick. An "eligible set" cache is a
/// plausible follow-up but isn't implemented since nothing currently
/// demonstrates it's a bottleneck at the scale this scheduler targets.
pub trait Policy: Send + Sync {
    fn select<'a>(
        &self,
        registry: &'a NodeRegistry,
        is_eligible_cluster: &dyn Fn(&Node) -> bool,
    ) -> Option<IpAddr>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadBalance;

impl Policy for LoadBalance {
    fn select<'a>(
        &self,
        registry: &'a NodeRegistry,
        is_eligible_cluster: &dyn Fn(&Node) -> bool,
    ) -> Option<IpAddr> {
        registry
            .iter()
            .filter(|n| n.has_free_slot() && is_eligible_cluster(n))
            .min_by(|a, b| {
                a.load_fraction()
                    .partial_cmp(&b.load_fraction())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|n| n.ip_addr)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FastNode;

impl Policy for FastNode {
    fn select<'a>(
        &self,
        registry: &'a NodeRegistry,
        is_eligible_cluster: &dyn Fn(&Node) -> bool,
    ) -> Option<IpAddr> {
        registry
            .iter()
            .filter(|n| n.has_free_slot() && is_eligible_cluster(n))
            .min_by(|a, b| {
                a.avg_cpu_time()
                    .partial_cmp(&b.avg_cpu_time())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|n| n.ip_addr)
    }
}
