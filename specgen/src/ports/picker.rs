//! Host port candidates for random allocation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::net::{Ipv4Addr, TcpListener};

/// Source of candidate host ports.
///
/// Candidates are only suggestions: the allocator still checks them against
/// the ports already claimed by the container and retries a bounded number
/// of times.
pub trait PortPicker: Send + Sync {
    fn candidate(&self) -> SpecgenResult<u16>;
}

/// Which picker the engine uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortAllocation {
    /// Ask the kernel for a free ephemeral port.
    #[default]
    Bind,
    /// Uniformly random unprivileged port.
    Random,
}

impl PortAllocation {
    pub fn picker(&self) -> &'static dyn PortPicker {
        static BIND: BindPortPicker = BindPortPicker;
        static RANDOM: RandomPortPicker = RandomPortPicker;
        match self {
            PortAllocation::Bind => &BIND,
            PortAllocation::Random => &RANDOM,
        }
    }
}

/// Binds port 0 and reports the port the kernel chose.
pub struct BindPortPicker;

impl PortPicker for BindPortPicker {
    fn candidate(&self) -> SpecgenResult<u16> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = listener.local_addr()?.port();
        drop(listener);
        if port == 0 {
            return Err(SpecgenError::Internal("kernel returned port 0".into()));
        }
        Ok(port)
    }
}

/// Picks from the unprivileged range without touching the network.
pub struct RandomPortPicker;

const RANDOM_PORT_MIN: u16 = 1024;

impl PortPicker for RandomPortPicker {
    fn candidate(&self) -> SpecgenResult<u16> {
        Ok(rand::rng().random_range(RANDOM_PORT_MIN..=u16::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_picker_range() {
        for _ in 0..100 {
            let port = RandomPortPicker.candidate().unwrap();
            assert!(port >= RANDOM_PORT_MIN);
        }
    }

    #[test]
    fn test_bind_picker_returns_nonzero() {
        let port = BindPortPicker.candidate().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_allocation_default_is_bind() {
        assert_eq!(PortAllocation::default(), PortAllocation::Bind);
        let _ = PortAllocation::Random.picker().candidate().unwrap();
    }
}
