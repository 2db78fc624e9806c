//! Built-in CIDR bitmap allocator

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tracing::warn;

use super::{IpAllocator, IpamError};

/// First-fit bitmap allocator over a single IPv4 CIDR.
///
/// The network and broadcast addresses are never handed out. All state
/// lives under one mutex; the critical section is a linear scan over the
/// bitmap words, worst case O(range/64).
#[derive(Debug)]
pub struct CidrAllocator {
    net: Ipv4Net,
    inner: Mutex<Bitmap>,
}

#[derive(Debug)]
struct Bitmap {
    words: Vec<u64>,
    in_use: usize,
}

impl CidrAllocator {
    /// Create an allocator for the given CIDR.
    ///
    /// A CIDR with no usable host addresses (/31, /32) is accepted here;
    /// every allocation from it fails with [`IpamError::EmptyRange`].
    pub fn new(net: Ipv4Net) -> Self {
        let size = Self::range_size(&net);
        Self {
            net,
            inner: Mutex::new(Bitmap {
                words: vec![0u64; (size + 63) / 64],
                in_use: 0,
            }),
        }
    }

    fn range_size(net: &Ipv4Net) -> usize {
        1usize << (32 - net.prefix_len())
    }

    /// Indices handed out: everything except network (0) and broadcast
    /// (size-1). Empty for /31 and /32.
    fn usable(&self) -> std::ops::Range<usize> {
        let size = Self::range_size(&self.net);
        if size <= 2 {
            0..0
        } else {
            1..size - 1
        }
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        if !self.net.contains(&ip) {
            return None;
        }
        let base = u32::from(self.net.network());
        Some((u32::from(ip) - base) as usize)
    }

    fn ip_at(&self, index: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.net.network()) + index as u32)
    }

    /// Number of addresses currently held
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }
}

impl IpAllocator for CidrAllocator {
    fn allocate(&self, pod: &str) -> Result<Ipv4Addr, IpamError> {
        let usable = self.usable();
        if usable.is_empty() {
            return Err(IpamError::EmptyRange);
        }

        let mut bitmap = self.inner.lock();
        for (word_index, word) in bitmap.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = word_index * 64 + bit;
            if !usable.contains(&index) {
                // Network address: only index 0 can land here, probe the
                // next free bit in the same word.
                let masked = *word | 1u64.checked_shl(bit as u32).unwrap_or(0);
                if masked == u64::MAX {
                    continue;
                }
                let bit = (!masked).trailing_zeros() as usize;
                let index = word_index * 64 + bit;
                if !usable.contains(&index) {
                    continue;
                }
                bitmap.words[word_index] |= 1u64 << bit;
                bitmap.in_use += 1;
                return Ok(self.ip_at(index));
            }
            bitmap.words[word_index] |= 1u64 << bit;
            bitmap.in_use += 1;
            return Ok(self.ip_at(index));
        }

        warn!(pod = %pod, cidr = %self.net, "Address range exhausted");
        Err(IpamError::RangeExhausted)
    }

    fn release(&self, pod: &str, ip: Ipv4Addr) {
        let Some(index) = self.index_of(ip) else {
            warn!(pod = %pod, ip = %ip, cidr = %self.net, "Released IP outside managed range");
            return;
        };
        let mut bitmap = self.inner.lock();
        let word = &mut bitmap.words[index / 64];
        let mask = 1u64 << (index % 64);
        if *word & mask != 0 {
            *word &= !mask;
            bitmap.in_use -= 1;
        }
    }

    fn restore(&self, pod: &str, ip: Ipv4Addr) {
        let Some(index) = self.index_of(ip) else {
            warn!(pod = %pod, ip = %ip, cidr = %self.net, "Observed IP outside managed range");
            return;
        };
        let mut bitmap = self.inner.lock();
        let word = &mut bitmap.words[index / 64];
        let mask = 1u64 << (index % 64);
        if *word & mask == 0 {
            *word |= mask;
            bitmap.in_use += 1;
        }
    }
}
