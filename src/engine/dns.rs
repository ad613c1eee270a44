//! Minimal DNS responder.
//!
//! Queries seen on UDP/53 are forwarded verbatim to the upstream resolver
//! over a short-lived socket; the response payload is handed back to the
//! engine to be injected into the TUN with swapped endpoints. The query ID
//! inside the payload is passed through untouched.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const MAX_RESPONSE: usize = 4096;

/// Forwards DNS queries and tracks which are in flight.
pub struct DnsForwarder {
    upstream: SocketAddr,
    deadline: Duration,
    inflight: DashMap<(u16, u16), Instant>,
}

impl DnsForwarder {
    pub fn new(upstream: SocketAddr, deadline: Duration) -> Self {
        Self {
            upstream,
            deadline,
            inflight: DashMap::new(),
        }
    }

    /// Number of transactions currently awaiting an upstream answer.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Forwards one query payload upstream and returns the response payload.
    ///
    /// `None` on timeout or upstream failure; the device retries on its own.
    /// A query that duplicates an in-flight `(src_port, query_id)` pair is
    /// dropped.
    pub async fn resolve(&self, query: &[u8], src_port: u16) -> Option<Vec<u8>> {
        if query.len() < 2 {
            debug!(target: "sproxy::dns", "query shorter than its id, dropped");
            return None;
        }
        let query_id = u16::from_be_bytes([query[0], query[1]]);
        let key = (src_port, query_id);
        if self.inflight.insert(key, Instant::now()).is_some() {
            debug!(target: "sproxy::dns", query_id, "duplicate in-flight query dropped");
            return None;
        }
        let result = self.exchange(query).await;
        self.inflight.remove(&key);
        if result.is_none() {
            debug!(
                target: "sproxy::dns",
                query_id,
                upstream = %self.upstream,
                "upstream timed out, query dropped"
            );
        }
        result
    }

    async fn exchange(&self, query: &[u8]) -> Option<Vec<u8>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        socket.send_to(query, self.upstream).await.ok()?;
        let mut buf = vec![0u8; MAX_RESPONSE];
        let (n, _) = timeout(self.deadline, socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        buf.truncate(n);
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stands in for the upstream resolver: answers every query by echoing
    /// the id and appending a marker.
    async fn spawn_upstream() -> SocketAddr {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let mut reply = buf[..2.min(n)].to_vec();
                reply.extend_from_slice(b"\x81\x80answer");
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn forwards_and_returns_response() {
        let upstream = spawn_upstream().await;
        let dns = DnsForwarder::new(upstream, Duration::from_secs(5));
        let response = dns.resolve(b"\x12\x34query", 40000).await.unwrap();
        assert_eq!(&response[..2], b"\x12\x34");
        assert_eq!(dns.inflight_count(), 0);
    }

    #[tokio::test]
    async fn timeout_drops_the_query() {
        // An unused socket that never answers.
        let silent = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let dns = DnsForwarder::new(silent.local_addr().unwrap(), Duration::from_millis(50));
        assert!(dns.resolve(b"\x00\x01query", 40000).await.is_none());
        assert_eq!(dns.inflight_count(), 0);
    }

    #[tokio::test]
    async fn runt_query_is_dropped() {
        let upstream = spawn_upstream().await;
        let dns = DnsForwarder::new(upstream, Duration::from_secs(1));
        assert!(dns.resolve(b"\x01", 1).await.is_none());
    }
}
