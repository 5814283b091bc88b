use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::{bail_value, Device, DeviceGroup, NDArray, Result};

/// One point-to-point message of a batched exchange.
#[derive(Clone, Debug)]
pub struct Transfer {
    pub src: Device,
    pub dst: Device,
    pub data: NDArray,
}

/// The communication layer as seen by the graph core.
///
/// Implementations may fail with [`crate::Error::Timeout`] when a peer stalls.
pub trait CommBackend {
    /// Post every send and receive of `transfers` and wait for all of them.
    /// Returns the received arrays in the order of `transfers`.
    fn batched_isend_irecv(&self, transfers: Vec<Transfer>) -> Result<Vec<NDArray>>;

    fn barrier(&self, group: &DeviceGroup) -> Result<()>;
}

/// Traffic counters of a [`LocalComm`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommStats {
    pub batches: usize,
    pub messages: usize,
    pub elements: usize,
    pub barriers: usize,
}

/// Simulates every rank of a device mesh inside the current process.
#[derive(Debug, Default)]
pub struct LocalComm {
    batches: AtomicUsize,
    messages: AtomicUsize,
    elements: AtomicUsize,
    barriers: AtomicUsize,
}

impl LocalComm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CommStats {
        CommStats {
            batches: self.batches.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            elements: self.elements.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
        }
    }
}

impl CommBackend for LocalComm {
    fn batched_isend_irecv(&self, transfers: Vec<Transfer>) -> Result<Vec<NDArray>> {
        if transfers.is_empty() {
            return Ok(Vec::new());
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        let mut received = Vec::with_capacity(transfers.len());
        for t in transfers {
            if t.data.device() != t.src {
                bail_value!(
                    "transfer claims source {} but data lives on {}",
                    t.src,
                    t.data.device()
                );
            }
            trace!(src = %t.src, dst = %t.dst, numel = t.data.numel(), "p2p");
            self.messages.fetch_add(1, Ordering::Relaxed);
            self.elements.fetch_add(t.data.numel(), Ordering::Relaxed);
            received.push(t.data.to_device(t.dst));
        }
        Ok(received)
    }

    fn barrier(&self, _group: &DeviceGroup) -> Result<()> {
        self.barriers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
