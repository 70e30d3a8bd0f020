/// Network stack integration: the smoltcp device adapter over the
/// virtio-net driver, and interface bring-up.
pub mod device;
pub mod stack;

/// Hostname announced by this interface.
pub const HOSTNAME: &str = "uniboot";

/// Interface name prefix; instances are "en0", "en1", ...
pub const IFACE_PREFIX: &str = "en";

/// Default MTU. Matches the most restrictive common cloud fabric so new
/// deployments work without tuning.
pub const MTU: usize = 1460;
