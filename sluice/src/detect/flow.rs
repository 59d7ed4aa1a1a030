use crate::detect::Protocol;
use hashbrown::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Identifies one TCP connection for the detector cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    /// Build a key from the peer and local socket addresses. IPv6 peers
    /// are not cached.
    pub fn from_addrs(src: SocketAddr, dst: SocketAddr) -> Option<FlowKey> {
        match (src.ip(), dst.ip()) {
            (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => Some(FlowKey {
                src_ip,
                dst_ip,
                src_port: src.port(),
                dst_port: dst.port(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub protocol: Protocol,
    pub confidence: u8,
    pub last_seen: u64,
    pub seq_number: u64,
}

/// Bounded cache of per-flow classification results. Entries expire after
/// the configured idle timeout; when full, expired entries are evicted
/// first and the stalest entry is displaced as a last resort.
pub struct FlowCache {
    map: HashMap<FlowKey, FlowEntry>,
    capacity: usize,
    timeout_secs: u64,
}

impl FlowCache {
    pub fn new(capacity: usize, timeout_secs: u64) -> FlowCache {
        FlowCache {
            map: HashMap::with_capacity(capacity),
            capacity,
            timeout_secs,
        }
    }

    /// Look up a live entry, refreshing its idle clock.
    pub fn find(&mut self, key: &FlowKey, now: u64) -> Option<&FlowEntry> {
        let expired = match self.map.get(key) {
            Some(entry) => now.saturating_sub(entry.last_seen) > self.timeout_secs,
            _ => return None,
        };

        if expired {
            self.map.remove(key);
            return None;
        }

        let entry = self.map.get_mut(key).expect("Entry vanished under lookup");
        entry.last_seen = now;
        entry.seq_number += 1;

        Some(entry)
    }

    pub fn insert(&mut self, key: FlowKey, protocol: Protocol, confidence: u8, now: u64) {
        if !self.map.contains_key(&key) && self.map.len() >= self.capacity {
            self.evict_expired(now);

            // Displace the stalest flow when eviction freed nothing.
            if self.map.len() >= self.capacity {
                if let Some(stalest) = self
                    .map
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_seen)
                    .map(|(key, _)| *key)
                {
                    self.map.remove(&stalest);
                }
            }
        }

        let entry = self.map.entry(key).or_insert(FlowEntry {
            protocol,
            confidence,
            last_seen: now,
            seq_number: 0,
        });

        entry.protocol = protocol;
        entry.confidence = confidence;
        entry.last_seen = now;
    }

    /// Drop all entries idle past the timeout. Returns the eviction count.
    pub fn evict_expired(&mut self, now: u64) -> usize {
        let timeout = self.timeout_secs;
        let before = self.map.len();

        self.map
            .retain(|_, entry| now.saturating_sub(entry.last_seen) <= timeout);

        before - self.map.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
