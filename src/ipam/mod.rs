//! Pod IP allocation
//!
//! Two allocator variants sit behind one interface: the built-in
//! [`CidrAllocator`] hands out addresses from a single configured CIDR,
//! and an external CNI integration can take its place on platforms that
//! support it (see [`cni`]). Allocator state is process-local; on restart
//! it is reconstructed from the pod set observed during the initial list.

mod cidr;
pub mod cni;

pub use cidr::CidrAllocator;

use std::net::Ipv4Addr;

#[cfg(test)]
use mockall::automock;

use thiserror::Error;

/// Errors from pod IP allocation
#[derive(Debug, Error)]
pub enum IpamError {
    /// The configured CIDR contains no usable addresses
    #[error("CIDR contains no usable addresses")]
    EmptyRange,

    /// Every usable address is currently held by a live pod
    #[error("address range exhausted")]
    RangeExhausted,
}

/// Hands out and reclaims pod IPs.
///
/// Allocate and release are serialized internally to preserve uniqueness:
/// within one process, no two live pods ever hold the same address. An
/// allocation failure is surfaced to the pod's status and retried on the
/// pod's next event; it never blocks a reconcile.
#[cfg_attr(test, automock)]
pub trait IpAllocator: Send + Sync {
    /// Allocate an address for the named pod
    fn allocate(&self, pod: &str) -> Result<Ipv4Addr, IpamError>;

    /// Return the pod's address to the pool
    fn release(&self, pod: &str, ip: Ipv4Addr);

    /// Mark an address as already in use, without allocating it.
    ///
    /// Called while walking the initial pod list so that addresses
    /// assigned before a restart are never handed out twice.
    fn restore(&self, pod: &str, ip: Ipv4Addr);
}
