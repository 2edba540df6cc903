//! Tenants and their addresses.
//!
//! Every tenant on a host gets its own IPv4 address, bound as an alias on the isolation
//! device and used by the module to classify traffic. The address is a pure function of the
//! host's data-plane address and the tenant id, `11.<tid>.<c>.<d>` for host `a.b.c.d`, so
//! teardown can always find what setup created. Within one testbed /16 the mapping is
//! injective and `tenant_of` inverts it.

use std::fmt;
use std::net::Ipv4Addr;

use crate::config::MAX_TENANTS;
use crate::error::RunnerError;

/// First octet of every tenant address.
pub const TENANT_NET: u8 = 11;

/// A small integer naming a traffic class on a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(u8);

impl TenantId {
    /// Tenant ids run from 1 to 255.
    pub fn new(id: usize) -> Result<Self, RunnerError> {
        if id == 0 || id > MAX_TENANTS {
            return Err(RunnerError::configuration(format!(
                "tenant id {} out of range 1..={}",
                id, MAX_TENANTS
            )));
        }
        Ok(TenantId(id as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant created on some host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    pub ip: Ipv4Addr,
}

impl Tenant {
    pub fn new(host_ip: Ipv4Addr, id: TenantId) -> Self {
        Tenant {
            id,
            ip: tenant_ip(host_ip, id),
        }
    }
}

/// The address of tenant `id` on the host with data-plane address `host_ip`.
pub fn tenant_ip(host_ip: Ipv4Addr, id: TenantId) -> Ipv4Addr {
    let [_, _, c, d] = host_ip.octets();
    Ipv4Addr::new(TENANT_NET, id.get(), c, d)
}

/// Recover the tenant id and the low half of the host address from a tenant address.
pub fn tenant_of(ip: Ipv4Addr) -> Option<(TenantId, [u8; 2])> {
    match ip.octets() {
        [TENANT_NET, tid, c, d] if tid > 0 => Some((TenantId(tid), [c, d])),
        _ => None,
    }
}

/// Check that no two hosts map their tenants onto the same addresses.
pub fn check_distinct(hosts: &[Ipv4Addr]) -> Result<(), RunnerError> {
    for (i, a) in hosts.iter().enumerate() {
        for b in hosts[i + 1..].iter() {
            if a.octets()[2..] == b.octets()[2..] {
                return Err(RunnerError::configuration(format!(
                    "hosts {} and {} would share tenant addresses",
                    a, b
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn addresses_are_deterministic_and_invertible() -> Result<(), failure::Error> {
        let host = Ipv4Addr::new(10, 0, 1, 2);
        let tid = TenantId::new(3)?;

        let ip = tenant_ip(host, tid);
        assert_eq!(ip, Ipv4Addr::new(11, 3, 1, 2));
        assert_eq!(ip, tenant_ip(host, tid));
        assert_eq!(tenant_of(ip), Some((tid, [1, 2])));
        assert_eq!(tenant_of(host), None);

        Ok(())
    }

    #[test]
    fn addresses_are_injective() -> Result<(), failure::Error> {
        let hosts: Vec<_> = (1..=8).map(|d| Ipv4Addr::new(10, 0, 1, d)).collect();
        check_distinct(&hosts)?;

        let mut seen = HashSet::new();
        for host in hosts.iter() {
            for t in 1..=MAX_TENANTS {
                assert!(seen.insert(tenant_ip(*host, TenantId::new(t)?)));
            }
        }
        assert_eq!(seen.len(), hosts.len() * MAX_TENANTS);

        Ok(())
    }

    #[test]
    fn rejects_bad_ids_and_colliding_hosts() {
        assert!(TenantId::new(0).is_err());
        assert!(TenantId::new(256).is_err());
        assert!(check_distinct(&[Ipv4Addr::new(10, 0, 1, 1), Ipv4Addr::new(10, 9, 1, 1)]).is_err());
    }
}
