use super::UpstreamInstance;
use std::net::IpAddr;

/// `servers[hash(client_ip) % n]` — stable for a given client as long as
/// the healthy subset does not change.
#[derive(Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select(
        &self,
        candidates: &[UpstreamInstance],
        client_ip: IpAddr,
    ) -> Option<UpstreamInstance> {
        let hash = match client_ip {
            IpAddr::V4(ip) => fnv1a(&ip.octets()),
            IpAddr::V6(ip) => fnv1a(&ip.octets()),
        };
        let idx = (hash % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
