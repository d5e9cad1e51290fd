//! Port Allocator: hands out unused TCP ports from a configured range.
//!
//! Grounded on `runtime/runner.rs::next_available_port`, strengthened from a
//! used-port scan to an actual connect probe against the candidate port.

use std::collections::HashSet;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("no port available in range [{0}, {1}]")]
    NoPortAvailable(u16, u16),
}

pub struct PortAllocator {
    base: u16,
    max: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            base,
            max,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Return the lowest unallocated port that also fails a local connect
    /// probe (i.e. nothing else is listening there), and mark it allocated.
    pub fn next_port(&self) -> Result<u16, PortAllocatorError> {
        let mut allocated = self.allocated.lock().unwrap();
        for port in self.base..=self.max {
            if allocated.contains(&port) {
                continue;
            }
            if !port_is_bound(port) {
                allocated.insert(port);
                debug!(port, "allocated port");
                return Ok(port);
            }
        }
        Err(PortAllocatorError::NoPortAvailable(self.base, self.max))
    }

    pub fn release(&self, port: u16) {
        let mut allocated = self.allocated.lock().unwrap();
        if allocated.remove(&port) {
            debug!(port, "released port");
        }
    }
}

fn port_is_bound(port: u16) -> bool {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port_first() {
        let allocator = PortAllocator::new(40000, 40010);
        let first = allocator.next_port().unwrap();
        assert_eq!(first, 40000);
        let second = allocator.next_port().unwrap();
        assert_eq!(second, 40001);
    }

    #[test]
    fn release_makes_port_eligible_again() {
        let allocator = PortAllocator::new(40100, 40101);
        let first = allocator.next_port().unwrap();
        assert!(allocator.next_port().is_ok());
        assert!(allocator.next_port().is_err());
        allocator.release(first);
        assert_eq!(allocator.next_port().unwrap(), first);
    }

    #[test]
    fn exhausted_range_reports_no_port_available() {
        let allocator = PortAllocator::new(40200, 40200);
        allocator.next_port().unwrap();
        let err = allocator.next_port().unwrap_err();
        assert!(matches!(err, PortAllocatorError::NoPortAvailable(40200, 40200)));
    }
}
