//! Host port allocation.
//!
//! Ports come from the OS (bind to port 0, read it back, drop the listener).
//! Nothing is reserved at the OS level after the query, so another process
//! may still grab the port before the container binds it. Within this
//! process a lease set keeps two live runs from receiving the same port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

const MAX_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn leased(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.leased
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn allocate(&self) -> std::io::Result<u16> {
        let allocator = self.clone();
        tokio::task::spawn_blocking(move || allocator.allocate_blocking())
            .await
            .map_err(std::io::Error::other)?
    }

    fn allocate_blocking(&self) -> std::io::Result<u16> {
        for _ in 0..MAX_ATTEMPTS {
            let port = {
                let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
                listener.local_addr()?.port()
            };
            if self.leased().insert(port) {
                debug!(port, "host port leased");
                return Ok(port);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "operating system kept returning leased ports",
        ))
    }

    /// Returns a port to the pool. Returns `false` if it was not leased.
    pub fn release(&self, port: u16) -> bool {
        let released = self.leased().remove(&port);
        if released {
            debug!(port, "host port released");
        }
        released
    }

    pub fn leased_count(&self) -> usize {
        self.leased().len()
    }
}
