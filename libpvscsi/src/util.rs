//! Size arithmetic and endpoint parsing shared by the services.

use std::path::PathBuf;

use crate::error::CsiError;

/// One gibibyte in bytes.  PowerVS sizes disks in whole GiB.
pub const GIB: u64 = 1 << 30;

/// Number of whole GiB needed to hold `bytes`, rounding up.
pub fn bytes_to_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

pub fn gib_to_bytes(gib: u64) -> u64 {
    gib.saturating_mul(GIB)
}

/// Round `bytes` up to the next whole GiB.
pub fn round_up_bytes(bytes: u64) -> u64 {
    gib_to_bytes(bytes_to_gib(bytes))
}

/// Parse a CSI endpoint of the form `unix:///path/to/csi.sock` into the
/// socket path.  Only Unix sockets are served.
pub fn parse_endpoint(endpoint: &str) -> Result<PathBuf, CsiError> {
    let (scheme, addr) = endpoint
        .split_once("://")
        .ok_or_else(|| CsiError::InvalidArgument(format!("invalid endpoint: {endpoint}")))?;

    if !scheme.eq_ignore_ascii_case("unix") {
        return Err(CsiError::InvalidArgument(format!(
            "unsupported endpoint scheme {scheme:?}, only unix sockets are served"
        )));
    }
    if addr.is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint} has no socket path"
        )));
    }
    Ok(PathBuf::from(addr))
}
