//! Access to networking hardware.
//!
//! The `phy` module provides the [Device] abstraction the stack transmits
//! through, and a [Loopback] device useful for testing the stack without
//! hardware.
//!
//! A device carries whole network-layer datagrams; link-layer framing,
//! neighbor resolution and the receive loop all live below this interface.
//! Reception is push-based: whatever owns the hardware reads frames and hands
//! them to [`Stack::ip_input`](crate::stack::Stack::ip_input). Since the
//! stack transmits from arbitrary application threads as well as from the
//! receive path, devices must be shareable across threads.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::Result;

/// An interface for sending raw network datagrams.
pub trait Device: Send + Sync {
    /// Return the maximum transmission unit, in octets.
    ///
    /// No datagram larger than this is ever handed to `transmit`, and the
    /// TCP maximum segment size is derived from it.
    fn mtu(&self) -> usize;

    /// Transmit a single datagram.
    fn transmit(&self, datagram: &[u8]) -> Result<()>;
}

/// A loopback device.
#[derive(Debug)]
pub struct Loopback {
    queue: Mutex<VecDeque<Vec<u8>>>,
    mtu: usize,
}

impl Loopback {
    /// Creates a loopback device.
    ///
    /// Every packet transmitted through this device can be received back
    /// through it in FIFO order.
    pub fn new() -> Loopback {
        Loopback::with_mtu(65535)
    }

    /// Creates a loopback device with the given maximum transmission unit.
    pub fn with_mtu(mtu: usize) -> Loopback {
        Loopback {
            queue: Mutex::new(VecDeque::new()),
            mtu,
        }
    }

    /// Receive a single previously transmitted datagram, if any.
    pub fn receive(&self) -> Option<Vec<u8>> {
        self.queue.lock().unwrap().pop_front()
    }
}

impl Default for Loopback {
    fn default() -> Loopback {
        Loopback::new()
    }
}

impl Device for Loopback {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, datagram: &[u8]) -> Result<()> {
        self.queue.lock().unwrap().push_back(datagram.to_vec());
        Ok(())
    }
}
