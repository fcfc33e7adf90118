//! Address allocation policy on top of [`AllocationStore`].
//!
//! The first usable address of the subnet is the gateway (it lives on the
//! bridge). Containers get addresses from the rest of the subnet, scanning
//! forward from the last allocated address and wrapping back to the address
//! after the gateway.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{debug, info, instrument};

use crate::error::{CniError, Result};
use crate::store::AllocationStore;

/// Normalize `subnet` to its network address and check it can hold a
/// gateway plus at least one container.
pub fn validate_subnet(subnet: Ipv4Network) -> Result<Ipv4Network> {
    let subnet = Ipv4Network::new(subnet.network(), subnet.prefix())
        .map_err(|e| CniError::config(format!("invalid subnet {}: {}", subnet, e)))?;
    if subnet.prefix() > 30 {
        return Err(CniError::config(format!("subnet {} is too small, need at least a /30", subnet)));
    }
    Ok(subnet)
}

/// The gateway of `subnet`: its first usable address.
///
/// Meaningful only for subnets accepted by [`validate_subnet`].
pub fn gateway_for(subnet: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()).saturating_add(1))
}

/// IP address allocator for one node-local pod subnet.
#[derive(Debug)]
pub struct IpAllocator {
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
    store: AllocationStore,
}

impl IpAllocator {
    /// Create an allocator for `subnet` backed by `store`.
    ///
    /// The subnet is normalized to its network address. Prefixes longer than
    /// /30 leave no room for a gateway plus one container and are rejected.
    pub fn new(subnet: Ipv4Network, store: AllocationStore) -> Result<Self> {
        let subnet = validate_subnet(subnet)?;
        Ok(Self { subnet, gateway: gateway_for(subnet), store })
    }

    /// Parse `cidr` and create an allocator for it.
    pub fn from_cidr(cidr: &str, store: AllocationStore) -> Result<Self> {
        let subnet: Ipv4Network = cidr
            .parse()
            .map_err(|e| CniError::config(format!("invalid subnet {:?}: {}", cidr, e)))?;
        Self::new(subnet, store)
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix(&self) -> u8 {
        self.subnet.prefix()
    }

    /// `ip` with the subnet's prefix length.
    pub fn ip_net(&self, ip: Ipv4Addr) -> Ipv4Network {
        // The prefix came from a valid network, so this never fails.
        Ipv4Network::new(ip, self.subnet.prefix()).unwrap_or(self.subnet)
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    /// Number of addresses available to containers.
    pub fn capacity(&self) -> u32 {
        u32::from(self.last_usable()) - u32::from(self.first_usable()) + 1
    }

    /// Allocate an address for `container_id`, or return the one it already has.
    ///
    /// # Errors
    ///
    /// Returns `CniError::Exhausted` when every usable address is taken.
    #[instrument(skip(self), fields(subnet = %self.subnet))]
    pub fn allocate_ip(&mut self, container_id: &str, if_name: &str) -> Result<Ipv4Addr> {
        let _guard = self.store.lock().exclusive()?;
        self.store.load()?;

        if let Some(ip) = self.store.query_by_id(container_id) {
            info!("container already owns {}", ip);
            return Ok(ip);
        }

        let start = match self.store.last() {
            Some(last) if self.is_usable(last) => last,
            _ => self.gateway,
        };

        let first = self.next_candidate(start);
        let mut candidate = first;
        loop {
            if !self.store.contains(candidate) {
                self.store.add(candidate, container_id, if_name)?;
                info!("allocated {}", candidate);
                return Ok(candidate);
            }
            debug!("{} is taken", candidate);

            candidate = self.next_candidate(candidate);
            if candidate == first {
                break;
            }
        }

        Err(CniError::Exhausted { subnet: self.subnet.to_string() })
    }

    /// Release the address held by `container_id`. Releasing nothing is fine.
    #[instrument(skip(self), fields(subnet = %self.subnet))]
    pub fn release_ip(&mut self, container_id: &str) -> Result<()> {
        let _guard = self.store.lock().exclusive()?;
        self.store.load()?;

        if self.store.remove(container_id)?.is_none() {
            debug!("no allocation to release");
        }
        Ok(())
    }

    /// Look up the address held by `container_id`.
    #[instrument(skip(self), fields(subnet = %self.subnet))]
    pub fn check_ip(&mut self, container_id: &str) -> Result<Ipv4Addr> {
        let _guard = self.store.lock().shared()?;
        self.store.load()?;

        self.store
            .query_by_id(container_id)
            .ok_or_else(|| CniError::not_found(format!("allocation for container {}", container_id)))
    }

    fn first_usable(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway) + 1)
    }

    fn last_usable(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.broadcast()) - 1)
    }

    fn is_usable(&self, ip: Ipv4Addr) -> bool {
        ip >= self.first_usable() && ip <= self.last_usable()
    }

    /// The address after `ip`, wrapping to the one after the gateway past the top.
    fn next_candidate(&self, ip: Ipv4Addr) -> Ipv4Addr {
        let next = Ipv4Addr::from(u32::from(ip).wrapping_add(1));
        if self.is_usable(next) {
            next
        } else {
            self.first_usable()
        }
    }
}
