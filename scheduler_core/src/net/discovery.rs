//! Node discovery (C3): a UDP broadcast/unicast `PING` to every configured
//! node, answered by a TCP `PONG` handshake the scheduler accepts on
//! `node_port`. The PING transport is UDP and best-effort; the handshake
//! that actually admits a node into the registry is TCP and reliable.
use crate::auth;
use crate::net::EngineHandle;
use crate::node::NodeInfo;
use crate::wire::{DiscoveryDatagram, Ping, Pong, PROTOCOL_VERSION};
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// A parsed `--nodes` entry: an ip/hostname pattern (possibly `*`-wildcarded
/// for a broadcast probe), an optional port override, and an optional name
/// pattern. Mirrors `cluster::NodeAllocation` but without the `max_cpus`
/// field a cluster-scoped allocation carries.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub ip_pattern: String,
    pub port: Option<u16>,
}

impl NodeSpec {
    pub fn wants_broadcast(&self) -> bool {
        self.ip_pattern.contains('*')
    }
}

/// Parses `--nodes ip[:port]` entries from the command line. A bare `*`
/// requests a broadcast probe on the default node port.
pub fn parse_node_specs(raw: &[String]) -> Vec<NodeSpec> {
    raw.iter()
        .map(|entry| match entry.split_once(':') {
            Some((ip, port)) => NodeSpec {
                ip_pattern: ip.to_string(),
                port: port.parse().ok(),
            },
            None => NodeSpec { ip_pattern: entry.clone(), port: None },
        })
        .collect()
}

/// Sends a `PING` to every spec: broadcast if it's wildcarded, unicast
/// otherwise. `our_sign` is included so the replying node can prove it saw
/// this exact ping when it answers with a `PONG` whose `auth` field we
/// verify.
pub async fn send_pings(
    specs: &[NodeSpec],
    ext_addrs: &[IpAddr],
    scheduler_port: u16,
    default_node_port: u16,
    our_sign: &[u8],
) -> std::io::Result<()> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.set_broadcast(true)?;

    let ping = Ping {
        version: PROTOCOL_VERSION.to_string(),
        ip_addr: ext_addrs.first().copied().unwrap_or(IpAddr::from([0, 0, 0, 0])),
        port: scheduler_port,
        sign: our_sign.to_vec(),
        ip_addrs: ext_addrs.to_vec(),
    };
    let datagram = DiscoveryDatagram::Ping(ping);
    let bytes = bincode::serialize(&datagram)
        .expect("Ping should always serialize");

    for spec in specs {
        let port = spec.port.unwrap_or(default_node_port);
        if spec.wants_broadcast() {
            tracing::debug!(port, "broadcasting discovery ping");
            let _ = sock.send_to(&bytes, SocketAddr::from(([255, 255, 255, 255], port))).await;
        } else if let Ok(ip) = spec.ip_pattern.parse::<IpAddr>() {
            tracing::debug!(%ip, port, "unicasting discovery ping");
            let _ = sock.send_to(&bytes, SocketAddr::from((ip, port))).await;
        } else {
            tracing::warn!(spec = %spec.ip_pattern, "not a broadcast pattern or a literal ip; skipping");
        }
    }
    Ok(())
}

/// Accepts TCP handshake connections on `node_port` forever. Each
/// connection is expected to send exactly one `Pong`; anything else, or an
/// auth mismatch, is dropped without being admitted. `our_sign` is the same
/// value sent in every outstanding `PING`, so the comparison binds the
/// handshake to a ping this process actually issued.
pub async fn run_handshake_listener(
    bind_addr: SocketAddr,
    cluster_secret: Vec<u8>,
    our_sign: Vec<u8>,
    handle: EngineHandle,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "discovery handshake listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        let cluster_secret = cluster_secret.clone();
        let our_sign = our_sign.clone();
        let handle = handle.clone();
        crate::net::spawn("discovery-handshake", async move {
            if let Err(e) = handle_handshake(stream, peer, &cluster_secret, &our_sign, &handle).await
            {
                tracing::debug!(%peer, error = %e, "discovery handshake failed");
            }
        });
    }
}

async fn handle_handshake(
    stream: TcpStream,
    peer: SocketAddr,
    cluster_secret: &[u8],
    our_sign: &[u8],
    handle: &EngineHandle,
) -> crate::error::Result<()> {
    let mut conn = crate::wire::Connection::new(stream);
    let Some(pong) = conn.recv::<Pong>().await else {
        return Err(crate::error::SchedulerError::ConnectionClosed);
    };

    let expected = auth::auth_code(cluster_secret, our_sign);
    if pong.auth != expected {
        tracing::warn!(%peer, "rejecting pong with invalid auth");
        return Err(crate::error::SchedulerError::BadAuth);
    }
    if pong.cpus == 0 || pong.port == 0 {
        tracing::debug!(%peer, "ignoring pong advertising zero cpus or port");
        return Ok(());
    }

    let info = NodeInfo {
        ip_addr: pong.ip_addr,
        port: pong.port,
        name: pong.name,
        auth_token: pong.sign.iter().map(|b| format!("{:02x}", b)).collect(),
        total_cpus: pong.cpus,
    };
    let outcome = handle.discover_node(info).await;
    tracing::debug!(%peer, ?outcome, "node handshake admitted");
    Ok(())
}

/// Listens on `bind_addr` for inbound `Pulse`/`Terminated` datagrams from
/// nodes. A stray `Ping`/`Pong` landing here (e.g. a node echoing the wrong
/// message) is logged and dropped rather than treated as a protocol error —
/// the UDP socket is best-effort by nature.
pub async fn run_pulse_listener(bind_addr: SocketAddr, handle: EngineHandle) -> std::io::Result<()> {
    let sock = UdpSocket::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "discovery pulse listener up");
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, peer) = sock.recv_from(&mut buf).await?;
        let Ok(datagram) = bincode::deserialize::<DiscoveryDatagram>(&buf[..len]) else {
            tracing::debug!(%peer, "dropping malformed discovery datagram");
            continue;
        };
        match datagram {
            DiscoveryDatagram::Pulse(pulse) => {
                handle.node_pulse(pulse.ip_addr).await;
            }
            DiscoveryDatagram::Terminated(msg) => {
                handle.node_terminated(msg.ip_addr).await;
            }
            DiscoveryDatagram::Ping(_) | DiscoveryDatagram::Pong(_) => {
                tracing::debug!(%peer, "ignoring ping/pong on the pulse socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_node_specs_splits_optional_port() {
        let specs = parse_node_specs(&["10.0.0.5:5555".to_string(), "*".to_string()]);
        assert_eq!(specs[0].ip_pattern, "10.0.0.5");
        assert_eq!(specs[0].port, Some(5555));
        assert!(specs[1].wants_broadcast());
        assert_eq!(specs[1].port, None);
    }

    #[tokio::test]
    async fn send_pings_to_a_unicast_target_does_not_error() {
        let specs = parse_node_specs(&["127.0.0.1:51999".to_string()]);
        let result = send_pings(&specs, &["127.0.0.1".parse().unwrap()], 51347, 51348, b"sign").await;
        assert!(result.is_ok());
    }
}
