//! Peer authorisation against the local node-identity daemon.
//!
//! Each connecting address is resolved to a node identity through the
//! daemon's unix socket and compared against a configured allowlist.
//! Loopback is always allowed; with an empty allowlist the gate is
//! disabled entirely. When the gate is enabled and the daemon cannot be
//! reached, the answer is deny.
//!
//! Outcomes are cached for five minutes, positive and negative alike;
//! eviction is purely time-based.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default identity daemon socket.
pub const DEFAULT_IDENTITY_SOCKET: &str = "/var/run/tailscale/tailscaled.sock";

/// Cache TTL for both positive and negative outcomes.
pub const PEER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolves a remote address to a node identity.
///
/// The production implementation talks to the identity daemon; tests plug
/// in a stub.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Return the lowercased short hostname behind `addr`, or `None` when
    /// the daemon is unreachable or does not know the address.
    async fn whois(&self, addr: IpAddr) -> Option<String>;
}

/// Identity resolution over the daemon's unix socket.
///
/// Speaks plain HTTP/1.0 over the socket: one `GET /localapi/v0/whois`
/// request, one JSON response.
pub struct SocketResolver {
    socket_path: PathBuf,
}

impl SocketResolver {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        SocketResolver {
            socket_path: socket_path.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for SocketResolver {
    async fn whois(&self, addr: IpAddr) -> Option<String> {
        let mut stream = match tokio::net::UnixStream::connect(&self.socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "identity daemon socket unreachable");
                return None;
            }
        };

        // The daemon rejects other Host headers.
        let request = format!(
            "GET /localapi/v0/whois?addr={addr}:1 HTTP/1.0\r\nHost: local-tailscaled.sock\r\n\r\n"
        );
        if let Err(e) = stream.write_all(request.as_bytes()).await {
            tracing::warn!(error = %e, "identity daemon write failed");
            return None;
        }

        let mut response = Vec::new();
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            stream.read_to_end(&mut response),
        )
        .await;
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "identity daemon read failed");
                return None;
            }
            Err(_) => {
                tracing::warn!("identity daemon read timed out");
                return None;
            }
        }

        parse_whois_response(&response)
    }
}

/// Extract the node's short hostname from a whois HTTP response.
fn parse_whois_response(raw: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(raw).ok()?;
    let (head, body) = text.split_once("\r\n\r\n")?;

    let status_line = head.lines().next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    if status != 200 {
        tracing::warn!(status, "identity daemon whois returned non-200");
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let node = value.get("Node")?;
    let name = node
        .get("ComputedName")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| node.get("Name").and_then(|v| v.as_str()))?;

    // "myhost.tailnet-name.ts.net." -> "myhost"
    let short = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
    if short.is_empty() {
        None
    } else {
        Some(short)
    }
}

struct CacheEntry {
    identity: Option<String>,
    allowed: bool,
    at: Instant,
}

/// The per-connection authorisation gate.
pub struct PeerAuth {
    /// Lowercased allowed identities; empty disables the gate.
    allowed: Vec<String>,
    resolver: Box<dyn IdentityResolver>,
    cache: Mutex<HashMap<IpAddr, CacheEntry>>,
    ttl: Duration,
}

impl PeerAuth {
    pub fn new(allowed_nodes: Vec<String>, resolver: Box<dyn IdentityResolver>) -> Self {
        Self::with_ttl(allowed_nodes, resolver, PEER_CACHE_TTL)
    }

    pub fn with_ttl(
        allowed_nodes: Vec<String>,
        resolver: Box<dyn IdentityResolver>,
        ttl: Duration,
    ) -> Self {
        PeerAuth {
            allowed: allowed_nodes
                .into_iter()
                .map(|n| n.to_ascii_lowercase())
                .collect(),
            resolver,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Whether the gate is active at all.
    pub fn enabled(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Decide whether a peer may use the API.
    pub async fn verify(&self, addr: IpAddr) -> bool {
        if !self.enabled() {
            return true;
        }
        if addr.is_loopback() {
            return true;
        }

        if let Some(cached) = self.cached(addr) {
            return cached;
        }

        let identity = self.resolver.whois(addr).await;
        let allowed = match &identity {
            Some(name) => self.allowed.iter().any(|a| a == name),
            // Unresolvable peers are denied while the gate is enabled.
            None => false,
        };

        match (&identity, allowed) {
            (Some(name), true) => tracing::info!(peer = %addr, node = %name, "peer allowed"),
            (Some(name), false) => {
                tracing::warn!(peer = %addr, node = %name, "peer denied, not in allowlist")
            }
            (None, _) => tracing::warn!(peer = %addr, "peer denied, identity unresolved"),
        }

        let mut cache = self.cache.lock().expect("peer cache lock poisoned");
        cache.insert(
            addr,
            CacheEntry {
                identity,
                allowed,
                at: Instant::now(),
            },
        );
        allowed
    }

    fn cached(&self, addr: IpAddr) -> Option<bool> {
        let cache = self.cache.lock().expect("peer cache lock poisoned");
        cache
            .get(&addr)
            .filter(|entry| entry.at.elapsed() < self.ttl)
            .map(|entry| entry.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubResolver {
        identity: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IdentityResolver for StubResolver {
        async fn whois(&self, _addr: IpAddr) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.identity.clone()
        }
    }

    fn stub(identity: Option<&str>) -> (Box<dyn IdentityResolver>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(StubResolver {
                identity: identity.map(String::from),
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn remote() -> IpAddr {
        "100.64.0.7".parse().unwrap()
    }

    #[tokio::test]
    async fn empty_allowlist_disables_the_gate() {
        let (resolver, calls) = stub(None);
        let auth = PeerAuth::new(vec![], resolver);
        assert!(auth.verify(remote()).await);
        // The resolver is never consulted when the gate is off.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loopback_is_always_allowed() {
        let (resolver, calls) = stub(None);
        let auth = PeerAuth::new(vec!["phone".into()], resolver);
        assert!(auth.verify("127.0.0.1".parse().unwrap()).await);
        assert!(auth.verify("::1".parse().unwrap()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allowlisted_identity_is_allowed_case_insensitively() {
        let (resolver, _) = stub(Some("michal-phone"));
        let auth = PeerAuth::new(vec!["Michal-Phone".into()], resolver);
        assert!(auth.verify(remote()).await);
    }

    #[tokio::test]
    async fn unknown_identity_is_denied() {
        let (resolver, _) = stub(Some("stranger"));
        let auth = PeerAuth::new(vec!["phone".into()], resolver);
        assert!(!auth.verify(remote()).await);
    }

    #[tokio::test]
    async fn unresolvable_peer_fails_closed() {
        let (resolver, _) = stub(None);
        let auth = PeerAuth::new(vec!["phone".into()], resolver);
        assert!(!auth.verify(remote()).await);
    }

    #[tokio::test]
    async fn outcomes_are_cached() {
        let (resolver, calls) = stub(Some("phone"));
        let auth = PeerAuth::new(vec!["phone".into()], resolver);
        assert!(auth.verify(remote()).await);
        assert!(auth.verify(remote()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_outcomes_are_cached_too() {
        let (resolver, calls) = stub(None);
        let auth = PeerAuth::new(vec!["phone".into()], resolver);
        assert!(!auth.verify(remote()).await);
        assert!(!auth.verify(remote()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_expires_by_time() {
        let (resolver, calls) = stub(Some("phone"));
        let auth = PeerAuth::with_ttl(vec!["phone".into()], resolver, Duration::ZERO);
        assert!(auth.verify(remote()).await);
        assert!(auth.verify(remote()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn whois_parsing() {
        let body = r#"{"Node":{"Name":"myhost.tail1234.ts.net.","ComputedName":"MyHost"}}"#;
        let raw = format!("HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{body}");
        assert_eq!(parse_whois_response(raw.as_bytes()), Some("myhost".into()));

        let raw = format!("HTTP/1.0 404 Not Found\r\n\r\n{body}");
        assert_eq!(parse_whois_response(raw.as_bytes()), None);

        assert_eq!(parse_whois_response(b"garbage"), None);
    }

    #[test]
    fn whois_parsing_falls_back_to_name() {
        let body = r#"{"Node":{"Name":"fallback.tail1234.ts.net.","ComputedName":""}}"#;
        let raw = format!("HTTP/1.0 200 OK\r\n\r\n{body}");
        assert_eq!(parse_whois_response(raw.as_bytes()), Some("fallback".into()));
    }
}
