//! External CNI allocator capability check
//!
//! On builds carrying the `cni` feature, pod IPs can come from the
//! host's CNI plugins instead of the built-in CIDR allocator: the
//! integration invokes the CNI binaries against a network namespace and
//! adapts the result to [`super::IpAllocator`]. When the capability
//! probe fails, the flag enabling CNI is rejected at startup.

use std::path::Path;

/// Conventional host location of CNI plugin binaries
pub const CNI_BIN_DIR: &str = "/opt/cni/bin";

/// True when this build and platform can delegate pod IP allocation to
/// CNI: the integration is compiled in, the OS is Linux, and the host
/// carries CNI plugin binaries.
pub fn supported() -> bool {
    cfg!(feature = "cni") && cfg!(target_os = "linux") && Path::new(CNI_BIN_DIR).is_dir()
}
