//! IP address allocation logic.
//!
//! This file carves fixed-size subnets out of an address pool and hands
//! out host addresses inside each subnet in request order.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::AssignmentError;
use crate::utils::ip_utils::{
    format_cidr, host_address, host_capacity, is_private_ipv4, network_address, nth_subnet, subnet_capacity,
};

/// Address pool subnets are carved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressPool {
    /// First address of the pool
    pub base: Ipv4Addr,
    /// Prefix length of the whole pool
    pub pool_prefix: u8,
    /// Prefix length of each subnet carved from the pool
    pub subnet_prefix: u8,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(10, 0, 0, 0),
            pool_prefix: 16,
            subnet_prefix: 24,
        }
    }
}

impl AddressPool {
    /// Check the prefixes describe a usable pool
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_prefix > 30 {
            return Err(format!("pool prefix /{} is too long", self.pool_prefix));
        }
        if self.subnet_prefix > 30 {
            return Err(format!("subnet prefix /{} leaves no host addresses", self.subnet_prefix));
        }
        if self.subnet_prefix < self.pool_prefix {
            return Err(format!(
                "subnet prefix /{} is shorter than pool prefix /{}",
                self.subnet_prefix, self.pool_prefix
            ));
        }
        if network_address(self.base, self.pool_prefix) != self.base {
            return Err(format!("{} is not aligned to /{}", self.base, self.pool_prefix));
        }
        Ok(())
    }

    /// Whether the whole pool lies inside private (RFC 1918) space
    pub fn is_private(&self) -> bool {
        let span = u32::MAX.checked_shr(u32::from(self.pool_prefix)).unwrap_or(0);
        let last = Ipv4Addr::from(u32::from(self.base) | span);
        is_private_ipv4(self.base) && is_private_ipv4(last)
    }

    /// Number of subnets the pool can hold
    pub fn capacity(&self) -> u64 {
        subnet_capacity(self.pool_prefix, self.subnet_prefix)
    }
}

impl std::fmt::Display for AddressPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} split into /{}", format_cidr(self.base, self.pool_prefix), self.subnet_prefix)
    }
}

/// Sequential subnet allocator over an [`AddressPool`]
#[derive(Debug)]
pub struct SubnetAllocator {
    pool: AddressPool,
    next_subnet: u32,
}

impl SubnetAllocator {
    pub fn new(pool: AddressPool) -> Result<Self, AssignmentError> {
        pool.validate().map_err(AssignmentError::InvalidPool)?;
        Ok(Self { pool, next_subnet: 0 })
    }

    /// Reserve `count` subnets up front, failing if the pool is too small
    pub fn ensure_capacity(&self, count: usize) -> Result<(), AssignmentError> {
        let capacity = self.pool.capacity();
        if count as u64 > capacity {
            return Err(AssignmentError::PoolExhausted {
                pool: self.pool.to_string(),
                needed: count,
                capacity,
            });
        }
        Ok(())
    }

    /// Next free subnet's network address
    pub fn allocate(&mut self) -> Result<Ipv4Addr, AssignmentError> {
        let network = nth_subnet(self.pool.base, self.pool.pool_prefix, self.pool.subnet_prefix, self.next_subnet)
            .ok_or_else(|| AssignmentError::PoolExhausted {
                pool: self.pool.to_string(),
                needed: self.next_subnet as usize + 1,
                capacity: self.pool.capacity(),
            })?;
        self.next_subnet += 1;
        Ok(network)
    }
}

/// Sequential host allocator inside one subnet
#[derive(Debug)]
pub struct HostAllocator {
    network: Ipv4Addr,
    prefix: u8,
    next_host: u32,
}

impl HostAllocator {
    pub fn new(network: Ipv4Addr, prefix: u8) -> Self {
        Self { network, prefix, next_host: 1 }
    }

    /// Next host address, starting at `.1`
    pub fn allocate(&mut self) -> Result<Ipv4Addr, AssignmentError> {
        let capacity = host_capacity(self.prefix);
        if self.next_host > capacity {
            return Err(AssignmentError::SubnetExhausted {
                subnet: format_cidr(self.network, self.prefix),
                needed: self.next_host as usize,
                capacity,
            });
        }
        let ip = host_address(self.network, self.next_host);
        self.next_host += 1;
        Ok(ip)
    }
}
