//! Deterministic per-sandbox network identity. Everything is derived from
//! the sandbox id, so any process on the host can recompute the tuple
//! without a registry. Cross-sandbox collisions are a hash-birthday event
//! the operator accepts.

use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAllocation {
    pub mac: String,
    pub gateway: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
    pub tap: String,
}

pub fn allocate_network(sandbox_id: &str) -> NetworkAllocation {
    let digest = Sha256::digest(sandbox_id.as_bytes());
    let (x, y) = (digest[0], digest[1]);
    NetworkAllocation {
        mac: format!("06:00:0A:{x:02X}:{y:02X}:02"),
        gateway: Ipv4Addr::new(10, x, y, 1),
        vm_ip: Ipv4Addr::new(10, x, y, 2),
        tap: format!("sbx-{x:02x}{y:02x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_deterministic() {
        let a = allocate_network("01HZX3V7J8K9M2N4P6Q8R1S3T5");
        let b = allocate_network("01HZX3V7J8K9M2N4P6Q8R1S3T5");
        assert_eq!(a, b);
    }

    #[test]
    fn different_ids_get_different_identities() {
        let a = allocate_network("sandbox-a");
        let b = allocate_network("sandbox-b");
        assert_ne!(a.tap, b.tap);
    }

    #[test]
    fn allocation_shape_matches_the_addressing_plan() {
        let alloc = allocate_network("some-sandbox");
        assert!(alloc.mac.starts_with("06:00:0A:"));
        assert!(alloc.mac.ends_with(":02"));
        assert_eq!(alloc.gateway.octets()[0], 10);
        assert_eq!(alloc.gateway.octets()[3], 1);
        assert_eq!(alloc.vm_ip.octets()[0], 10);
        assert_eq!(alloc.vm_ip.octets()[3], 2);
        assert_eq!(alloc.gateway.octets()[1..3], alloc.vm_ip.octets()[1..3]);
        assert!(alloc.tap.starts_with("sbx-"));
        assert_eq!(alloc.tap.len(), "sbx-".len() + 4);
    }

    #[test]
    fn gateway_and_vm_ip_come_from_the_digest() {
        let digest = Sha256::digest(b"pinned");
        let alloc = allocate_network("pinned");
        assert_eq!(alloc.gateway.octets()[1], digest[0]);
        assert_eq!(alloc.gateway.octets()[2], digest[1]);
        assert_eq!(alloc.tap, format!("sbx-{:02x}{:02x}", digest[0], digest[1]));
    }
}
