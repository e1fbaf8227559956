use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::ProxyError;

const DEFAULT_LOOPBACK: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Allocates loopback-range IPs from a configured IPv4 CIDR.
///
/// Allocation is first-fit scanning up from the network base. The
/// canonical loopback address is pre-acquired at construction when the
/// prefix contains it, so it is never handed out to a forward. The pool
/// is owned and mutated only by the port-forward worker.
pub struct IpPool {
    base: u32,
    prefix_len: u8,
    allocated: BTreeSet<u32>,
}

impl IpPool {
    pub fn new(cidr: &str) -> Result<Self, ProxyError> {
        let (base, prefix_len) = parse_ipv4_cidr(cidr)?;

        let mut pool = Self {
            base: u32::from(base) & prefix_mask(prefix_len),
            prefix_len,
            allocated: BTreeSet::new(),
        };

        if pool.contains(DEFAULT_LOOPBACK) {
            pool.acquire_specific(DEFAULT_LOOPBACK).map_err(|_| {
                ProxyError::Config(format!("cannot reserve {DEFAULT_LOOPBACK} in {cidr}"))
            })?;
        }

        Ok(pool)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let (first, last) = self.host_range();
        let ip = u32::from(ip);
        ip >= first && ip <= last
    }

    /// Hands out the lowest free address in the prefix.
    pub fn acquire(&mut self) -> Result<Ipv4Addr, ProxyError> {
        let (first, last) = self.host_range();
        let mut candidate = first;
        while candidate <= last {
            if !self.allocated.contains(&candidate) {
                self.allocated.insert(candidate);
                return Ok(Ipv4Addr::from(candidate));
            }
            candidate += 1;
        }
        Err(ProxyError::PoolExhausted)
    }

    pub fn acquire_specific(&mut self, ip: Ipv4Addr) -> Result<(), ProxyError> {
        if !self.contains(ip) {
            return Err(ProxyError::NotAllocated(ip));
        }
        if !self.allocated.insert(u32::from(ip)) {
            return Err(ProxyError::AlreadyAllocated(ip));
        }
        Ok(())
    }

    /// Returns an address to the free set. Releasing an address that is
    /// not currently held is an error so lifecycle bugs surface early.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), ProxyError> {
        if !self.allocated.remove(&u32::from(ip)) {
            return Err(ProxyError::NotAllocated(ip));
        }
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Usable host addresses: the network and broadcast addresses are
    /// excluded for prefixes shorter than /31.
    fn host_range(&self) -> (u32, u32) {
        let size = 1u64 << (32 - self.prefix_len);
        let last = self.base + (size - 1) as u32;
        if self.prefix_len >= 31 {
            (self.base, last)
        } else {
            (self.base + 1, last - 1)
        }
    }
}

fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), ProxyError> {
    let (ip, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| ProxyError::Config(format!("invalid cidr: {cidr}")))?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| ProxyError::Config(format!("invalid ip in cidr: {cidr}")))?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| ProxyError::Config(format!("invalid prefix length in cidr: {cidr}")))?;
    if prefix_len > 32 {
        return Err(ProxyError::Config(format!(
            "invalid prefix length /{prefix_len}"
        )));
    }
    Ok((ip, prefix_len))
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        (!0u32) << (32 - prefix_len)
    }
}
