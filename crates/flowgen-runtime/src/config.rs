//! Engine configuration.

use std::sync::Arc;

use flowgen_core::{NetError, NetResult};

use crate::crypto::Sealer;

/// Which transport stack a core drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// Kernel sockets multiplexed with epoll.
    Kernel,
    /// In-process user-space stack.
    Ustack,
}

/// Configuration for the engine.
#[derive(Clone)]
pub struct NetConfig {
    /// Number of cores (event-loop threads). Core 0 is the control
    /// core.
    pub cores: usize,

    /// Transport stack selection.
    pub stack: StackKind,

    /// Network device whose addresses feed the local address pool
    /// (kernel stack). Required for the kernel stack.
    pub device: Option<String>,

    /// Number of synthetic local IPs for the user-space stack pool.
    pub ip_count: usize,

    /// Local port range the connector rotates through.
    pub port_range: (u16, u16),

    /// Disable Nagle on outbound connections.
    pub no_delay: bool,

    /// Capacity of each cross-core ring, rounded up to a power of two.
    /// Fixed at configure time.
    pub ring_capacity: usize,

    /// Staged submissions per ring flush. 1 flushes immediately.
    pub batch_size: usize,

    /// Pin each core's thread to the matching CPU. Best-effort.
    pub pin_threads: bool,

    /// Optional AEAD transform applied to every payload.
    pub sealer: Option<Arc<dyn Sealer>>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            stack: StackKind::Kernel,
            device: None,
            ip_count: 200,
            port_range: (1025, 65530),
            no_delay: false,
            ring_capacity: 128,
            batch_size: 1,
            pin_threads: true,
            sealer: None,
        }
    }
}

impl NetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cores(mut self, n: usize) -> Self {
        self.cores = n;
        self
    }

    pub fn stack(mut self, stack: StackKind) -> Self {
        self.stack = stack;
        self
    }

    pub fn device(mut self, dev: impl Into<String>) -> Self {
        self.device = Some(dev.into());
        self
    }

    pub fn ip_count(mut self, n: usize) -> Self {
        self.ip_count = n;
        self
    }

    pub fn no_delay(mut self, on: bool) -> Self {
        self.no_delay = on;
        self
    }

    pub fn ring_capacity(mut self, n: usize) -> Self {
        self.ring_capacity = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn pin_threads(mut self, on: bool) -> Self {
        self.pin_threads = on;
        self
    }

    pub fn sealer(mut self, sealer: Arc<dyn Sealer>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.cores == 0 {
            return Err(NetError::config("cores must be at least 1"));
        }
        if self.stack == StackKind::Kernel && self.device.is_none() {
            return Err(NetError::config(
                "a network device must be assigned when using the kernel stack",
            ));
        }
        if self.ring_capacity == 0 {
            return Err(NetError::config("ring capacity must be non-zero"));
        }
        if self.batch_size == 0 {
            return Err(NetError::config("batch size must be at least 1"));
        }
        if self.port_range.0 == 0 || self.port_range.0 >= self.port_range.1 {
            return Err(NetError::config("invalid port range"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetConfig")
            .field("cores", &self.cores)
            .field("stack", &self.stack)
            .field("device", &self.device)
            .field("ip_count", &self.ip_count)
            .field("port_range", &self.port_range)
            .field("no_delay", &self.no_delay)
            .field("ring_capacity", &self.ring_capacity)
            .field("batch_size", &self.batch_size)
            .field("pin_threads", &self.pin_threads)
            .field("sealer", &self.sealer.as_ref().map(|_| "<set>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_stack_requires_device() {
        let cfg = NetConfig::new();
        assert!(cfg.validate().is_err());
        let cfg = NetConfig::new().device("lo");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_ustack_needs_no_device() {
        let cfg = NetConfig::new().stack(StackKind::Ustack).cores(3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_degenerate_values() {
        assert!(NetConfig::new().device("lo").cores(0).validate().is_err());
        assert!(NetConfig::new()
            .device("lo")
            .ring_capacity(0)
            .validate()
            .is_err());
        assert!(NetConfig::new().device("lo").batch_size(0).validate().is_err());
    }
}
