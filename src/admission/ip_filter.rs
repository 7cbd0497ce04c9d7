//! IP restriction: explicit time-bounded blocks and allow-list policy.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Explicitly blocked addresses with their unblock time.
#[derive(Debug, Default)]
pub struct IpBlockList {
    entries: Mutex<HashMap<IpAddr, Instant>>,
}

impl IpBlockList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `ip` for `duration` from now, replacing any earlier block.
    pub fn block_ip(&self, ip: IpAddr, duration: Duration) {
        self.entries.lock().insert(ip, Instant::now() + duration);
    }

    /// Returns whether an entry was removed.
    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.entries.lock().remove(&ip).is_some()
    }

    /// Expired entries count as unblocked and are removed on sight.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&ip) {
            Some(&until) if now < until => true,
            Some(_) => {
                entries.remove(&ip);
                false
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why [`IpPolicy`] refused an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpDenial {
    NotAllowed,
    PrivateNetwork,
}

/// Static allow-list and private-network policy.
#[derive(Debug, Clone)]
pub struct IpPolicy {
    allowed: Vec<IpNetwork>,
    allow_private: bool,
}

impl Default for IpPolicy {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            allow_private: true,
        }
    }
}

impl IpPolicy {
    /// An empty `allowed` list admits every address.
    #[must_use]
    pub const fn new(allowed: Vec<IpNetwork>, allow_private: bool) -> Self {
        Self {
            allowed,
            allow_private,
        }
    }

    /// Check a resolved client address, or `None` when it could not be resolved.
    ///
    /// Unresolved clients fail a non-empty allow-list and skip the
    /// private-network test.
    pub fn check(&self, ip: Option<IpAddr>) -> Result<(), IpDenial> {
        if !self.allowed.is_empty() {
            let listed = ip.is_some_and(|ip| self.allowed.iter().any(|net| net.contains(ip)));
            if !listed {
                return Err(IpDenial::NotAllowed);
            }
        }

        if !self.allow_private && ip.is_some_and(is_private) {
            return Err(IpDenial::PrivateNetwork);
        }

        Ok(())
    }
}

/// Loopback, RFC 1918, link-local, and IPv6 unique-local addresses.
#[must_use]
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn block_expires_and_entry_is_removed() {
        let list = IpBlockList::new();
        list.block_ip(ip("203.0.113.5"), Duration::from_secs(60));
        assert!(list.is_blocked(ip("203.0.113.5")));
        assert!(!list.is_blocked(ip("203.0.113.6")));

        advance(Duration::from_secs(61)).await;
        assert!(!list.is_blocked(ip("203.0.113.5")));
        assert!(list.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reblocking_overwrites_unblock_time() {
        let list = IpBlockList::new();
        list.block_ip(ip("203.0.113.5"), Duration::from_secs(10));
        list.block_ip(ip("203.0.113.5"), Duration::from_secs(120));

        advance(Duration::from_secs(60)).await;
        assert!(list.is_blocked(ip("203.0.113.5")));
    }

    #[tokio::test(start_paused = true)]
    async fn unblock_removes_entry() {
        let list = IpBlockList::new();
        list.block_ip(ip("203.0.113.5"), Duration::from_secs(60));
        assert!(list.unblock_ip(ip("203.0.113.5")));
        assert!(!list.unblock_ip(ip("203.0.113.5")));
        assert!(!list.is_blocked(ip("203.0.113.5")));
    }

    #[test]
    fn private_ranges() {
        for addr in ["10.1.2.3", "172.16.0.1", "192.168.1.1", "127.0.0.1", "169.254.0.9", "::1", "fd00::1", "fe80::1", "::ffff:10.0.0.1"] {
            assert!(is_private(ip(addr)), "{addr}");
        }
        for addr in ["8.8.8.8", "203.0.113.1", "2001:db8::1", "::ffff:8.8.8.8"] {
            assert!(!is_private(ip(addr)), "{addr}");
        }
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        let policy = IpPolicy::default();
        assert_eq!(policy.check(Some(ip("8.8.8.8"))), Ok(()));
        assert_eq!(policy.check(Some(ip("10.0.0.1"))), Ok(()));
        assert_eq!(policy.check(None), Ok(()));
    }

    #[test]
    fn allow_list_matches_cidr() {
        let policy = IpPolicy::new(vec!["203.0.113.0/24".parse().unwrap()], true);
        assert_eq!(policy.check(Some(ip("203.0.113.77"))), Ok(()));
        assert_eq!(policy.check(Some(ip("198.51.100.1"))), Err(IpDenial::NotAllowed));
        assert_eq!(policy.check(None), Err(IpDenial::NotAllowed));
    }

    #[test]
    fn private_networks_can_be_disallowed() {
        let policy = IpPolicy::new(Vec::new(), false);
        assert_eq!(policy.check(Some(ip("192.168.0.10"))), Err(IpDenial::PrivateNetwork));
        assert_eq!(policy.check(Some(ip("8.8.4.4"))), Ok(()));
        assert_eq!(policy.check(None), Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_block_and_lookup_stay_consistent() {
        let list = std::sync::Arc::new(IpBlockList::new());
        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..8_u8 {
            let list = std::sync::Arc::clone(&list);
            workers.spawn(async move {
                for host in 0..32_u8 {
                    let addr = IpAddr::from([10, worker, 0, host]);
                    list.block_ip(addr, Duration::from_secs(60));
                    assert!(list.is_blocked(addr));
                    tokio::task::yield_now().await;
                }
                for host in (0..32_u8).step_by(2) {
                    assert!(list.unblock_ip(IpAddr::from([10, worker, 0, host])));
                }
            });
        }
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }

        assert_eq!(list.len(), 8 * 16);
        assert!(list.is_blocked(ip("10.3.0.1")));
        assert!(!list.is_blocked(ip("10.3.0.2")));
    }
}
