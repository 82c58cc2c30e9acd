//! The TCP connection state machine and its blocking user commands.
//!
//! Connection state lives in a fixed table of protocol control blocks (PCBs)
//! guarded by a single stack-wide mutex. The table is shared between two
//! kinds of callers:
//!
//!  * the asynchronous receive path ([`Stack::tcp_input`](crate::Stack)),
//!    which runs the RFC 793 segment-arrival processing, and
//!  * the blocking user commands (`tcp_open`, `tcp_close`, `tcp_send`,
//!    `tcp_receive`), which may suspend on a per-PCB condition variable until
//!    the receive path moves the connection forward.
//!
//! A PCB whose waiters are still suspended cannot be torn down outright;
//! releasing it marks it `CLOSED` and wakes the waiters, and the last waiter
//! out finishes the teardown. A stack-wide [`interrupt`](crate::Stack::interrupt)
//! cancels every suspended command.

mod input;
mod output;
mod usrreq;

use core::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::stack::Stack;
use crate::wire::{IpEndpoint, TcpSeqNumber};

/// Number of protocol control block slots.
///
/// Connection identifiers handed out by `tcp_open` are indices into the
/// table, so they are small and stable for the lifetime of the connection.
pub(crate) const PCB_COUNT: usize = 16;

/// Capacity of the receive buffer of each connection, which is also the
/// largest window the stack ever advertises.
pub(crate) const RECV_BUFFER_SIZE: usize = 65535;

/// The state of a TCP connection, according to RFC 793.
///
/// `Free` is not a protocol state: it marks an unallocated slot in the PCB
/// table.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum State {
    #[default]
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Free => write!(f, "FREE"),
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::Closing => write!(f, "CLOSING"),
            State::TimeWait => write!(f, "TIME-WAIT"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::LastAck => write!(f, "LAST-ACK"),
        }
    }
}

/// The send sequence variables of a connection.
#[derive(Debug, Default)]
pub(crate) struct SendSequence {
    /// Oldest unacknowledged sequence number.
    pub una: TcpSeqNumber,
    /// Next sequence number to send.
    pub nxt: TcpSeqNumber,
    /// Send window advertised by the peer.
    pub wnd: u16,
    /// Send urgent pointer. Urgent data is not implemented.
    #[allow(dead_code)]
    pub up: u16,
    /// Sequence number of the segment used for the last window update.
    pub wl1: TcpSeqNumber,
    /// Acknowledgment number of the segment used for the last window update.
    pub wl2: TcpSeqNumber,
}

/// The receive sequence variables of a connection.
#[derive(Debug, Default)]
pub(crate) struct RecvSequence {
    /// Next sequence number expected.
    pub nxt: TcpSeqNumber,
    /// Remaining space in the receive buffer.
    pub wnd: u16,
    /// Receive urgent pointer. Urgent data is not implemented.
    #[allow(dead_code)]
    pub up: u16,
}

/// The receive buffer of a connection.
///
/// Payload is appended in arrival order and drained from the head by
/// `tcp_receive`; the buffered length and the advertised window always sum to
/// the fixed capacity.
#[derive(Debug, Default)]
pub(crate) struct RecvBuffer {
    data: Vec<u8>,
}

impl RecvBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn window(&self) -> usize {
        RECV_BUFFER_SIZE - self.data.len()
    }

    /// Append as much of `payload` as the free window allows, returning the
    /// number of octets accepted.
    pub fn enqueue_slice(&mut self, payload: &[u8]) -> usize {
        let size = payload.len().min(self.window());
        self.data.extend_from_slice(&payload[..size]);
        size
    }

    /// Move up to `buffer.len()` octets out of the head of the buffer,
    /// returning the number of octets moved.
    pub fn dequeue_slice(&mut self, buffer: &mut [u8]) -> usize {
        let size = buffer.len().min(self.data.len());
        buffer[..size].copy_from_slice(&self.data[..size]);
        self.data.drain(..size);
        size
    }
}

/// A TCP protocol control block.
#[derive(Debug, Default)]
pub(crate) struct Pcb {
    pub state: State,
    pub local: IpEndpoint,
    pub foreign: IpEndpoint,
    pub snd: SendSequence,
    /// Initial send sequence number.
    pub iss: TcpSeqNumber,
    pub rcv: RecvSequence,
    /// Initial receive sequence number.
    pub irs: TcpSeqNumber,
    /// Path maximum transmission unit.
    pub mtu: u16,
    /// Maximum segment size, `mtu` less the IP and TCP headers.
    pub mss: u16,
    pub buf: RecvBuffer,
    /// Number of user commands suspended on this PCB.
    pub waiters: usize,
    /// Set by an interrupt; makes current and future sleeps return
    /// cancellation until the last waiter has observed it.
    pub interrupted: bool,
}

impl Pcb {
    pub fn set_state(&mut self, state: State) {
        if self.state != state {
            net_trace!("{}:{}: state={}=>{}", self.local, self.foreign, self.state, state);
        }
        self.state = state;
    }
}

/// The table of protocol control blocks.
pub(crate) struct PcbTable {
    pub pcbs: Vec<Pcb>,
}

impl PcbTable {
    fn new() -> PcbTable {
        PcbTable {
            pcbs: (0..PCB_COUNT).map(|_| Pcb::default()).collect(),
        }
    }

    /// Claim the first free slot, moving it to `CLOSED`.
    pub fn alloc(&mut self) -> Option<usize> {
        for (id, pcb) in self.pcbs.iter_mut().enumerate() {
            if pcb.state == State::Free {
                pcb.state = State::Closed;
                return Some(id);
            }
        }
        None
    }

    /// Return the PCB with the given identifier, unless the slot is free.
    pub fn get(&self, id: usize) -> Option<&Pcb> {
        self.pcbs.get(id).filter(|pcb| pcb.state != State::Free)
    }

    /// Return the best match for a segment addressed to `local` from
    /// `foreign`.
    ///
    /// An exact four-tuple match (allowing a wildcard local address) wins
    /// over a `LISTEN` PCB with a fully wildcarded foreign endpoint. Matching
    /// scans slots in order, so the result depends only on the table
    /// contents.
    pub fn select(&self, local: &IpEndpoint, foreign: Option<&IpEndpoint>) -> Option<usize> {
        let mut listener = None;
        for (id, pcb) in self.pcbs.iter().enumerate() {
            if pcb.state == State::Free {
                continue;
            }
            if !(pcb.local.addr.is_unspecified() || pcb.local.addr == local.addr)
                || pcb.local.port != local.port
            {
                continue;
            }
            let Some(foreign) = foreign else {
                return Some(id);
            };
            if pcb.foreign == *foreign {
                return Some(id);
            }
            if pcb.state == State::Listen && pcb.foreign.is_unspecified() {
                listener = Some(id);
            }
        }
        listener
    }
}

/// The TCP half of a [Stack]: the PCB table behind the stack-wide mutex, and
/// one condition variable per slot for suspended user commands.
pub(crate) struct Tcp {
    pub table: Mutex<PcbTable>,
    ctx: [Condvar; PCB_COUNT],
}

impl Tcp {
    pub fn new() -> Tcp {
        Tcp {
            table: Mutex::new(PcbTable::new()),
            ctx: core::array::from_fn(|_| Condvar::new()),
        }
    }
}

impl Stack {
    /// Suspend the calling user command until the PCB is woken, releasing the
    /// table mutex while asleep.
    ///
    /// Returns the reacquired guard and whether the sleep was cancelled by an
    /// interrupt. The interrupt indicator stays set until the last waiter has
    /// observed it, so a broadcast cancels every suspended command exactly
    /// once.
    pub(crate) fn pcb_sleep<'a>(
        &self,
        id: usize,
        table: MutexGuard<'a, PcbTable>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, PcbTable>, bool) {
        let mut table = table;
        if table.pcbs[id].interrupted {
            return (table, true);
        }
        table.pcbs[id].waiters += 1;
        let mut table = match timeout {
            Some(duration) => {
                let (table, _timed_out) =
                    self.tcp.ctx[id].wait_timeout(table, duration).unwrap();
                table
            }
            None => self.tcp.ctx[id].wait(table).unwrap(),
        };
        table.pcbs[id].waiters -= 1;
        if table.pcbs[id].interrupted {
            if table.pcbs[id].waiters == 0 {
                table.pcbs[id].interrupted = false;
            }
            return (table, true);
        }
        (table, false)
    }

    /// Wake every user command suspended on the PCB.
    pub(crate) fn pcb_wake(&self, id: usize) {
        self.tcp.ctx[id].notify_all();
    }

    /// Release a PCB back to the free pool.
    ///
    /// If user commands are still suspended on it, the PCB is instead marked
    /// `CLOSED` and the waiters are woken; whichever waiter drains the slot
    /// last calls back into `pcb_release` and performs the actual teardown.
    pub(crate) fn pcb_release(&self, table: &mut PcbTable, id: usize) {
        let pcb = &mut table.pcbs[id];
        if pcb.waiters > 0 {
            pcb.set_state(State::Closed);
            self.tcp.ctx[id].notify_all();
            return;
        }
        net_debug!("released, local={}, foreign={}", pcb.local, pcb.foreign);
        *pcb = Pcb::default();
    }

    /// Cancel every suspended TCP user command.
    ///
    /// Each interrupted command returns [`Error::Interrupted`](crate::Error);
    /// a pending `tcp_open` additionally releases its PCB.
    pub fn interrupt(&self) {
        let mut table = self.tcp.table.lock().unwrap();
        for id in 0..PCB_COUNT {
            if table.pcbs[id].state != State::Free {
                table.pcbs[id].interrupted = true;
                self.tcp.ctx[id].notify_all();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::Ipv4Address;

    fn endpoint(addr: [u8; 4], port: u16) -> IpEndpoint {
        IpEndpoint::new(Ipv4Address(addr), port)
    }

    #[test]
    fn test_alloc_exhaustion() {
        let mut table = PcbTable::new();
        for id in 0..PCB_COUNT {
            assert_eq!(table.alloc(), Some(id));
        }
        assert_eq!(table.alloc(), None);
    }

    #[test]
    fn test_alloc_release_round_trip() {
        let stack = Stack::new();
        let mut table = stack.tcp.table.lock().unwrap();
        let id = table.alloc().unwrap();
        assert_eq!(table.pcbs[id].state, State::Closed);
        table.pcbs[id].local = endpoint([10, 0, 0, 2], 80);
        assert!(table.get(id).is_some());

        // Release with no waiters zeroes the slot.
        stack.pcb_release(&mut table, id);
        assert_eq!(table.pcbs[id].state, State::Free);
        assert_eq!(table.pcbs[id].local, IpEndpoint::UNSPECIFIED);
        assert!(table.get(id).is_none());
        assert_eq!(table.alloc(), Some(id));
    }

    #[test]
    fn test_get_rejects_free() {
        let table = PcbTable::new();
        assert!(table.get(0).is_none());
        assert!(table.get(PCB_COUNT).is_none());
    }

    #[test]
    fn test_select_exact_beats_listener() {
        let local = endpoint([10, 0, 0, 2], 80);
        let foreign = endpoint([10, 0, 0, 1], 30000);

        // The listener occupies a lower slot than the established connection,
        // and must still lose to it.
        let mut table = PcbTable::new();
        let listener = table.alloc().unwrap();
        table.pcbs[listener].state = State::Listen;
        table.pcbs[listener].local = endpoint([0, 0, 0, 0], 80);
        let established = table.alloc().unwrap();
        table.pcbs[established].state = State::Established;
        table.pcbs[established].local = local;
        table.pcbs[established].foreign = foreign;

        assert_eq!(table.select(&local, Some(&foreign)), Some(established));
        // A different peer falls back to the listener.
        let other = endpoint([10, 0, 0, 3], 30000);
        assert_eq!(table.select(&local, Some(&other)), Some(listener));
        // Without a foreign endpoint the first local match wins.
        assert_eq!(table.select(&local, None), Some(listener));
    }

    #[test]
    fn test_select_respects_port() {
        let mut table = PcbTable::new();
        let id = table.alloc().unwrap();
        table.pcbs[id].state = State::Listen;
        table.pcbs[id].local = endpoint([0, 0, 0, 0], 80);

        let foreign = endpoint([10, 0, 0, 1], 30000);
        assert_eq!(table.select(&endpoint([10, 0, 0, 2], 81), Some(&foreign)), None);
        assert_eq!(
            table.select(&endpoint([10, 0, 0, 2], 80), Some(&foreign)),
            Some(id)
        );
    }

    #[test]
    fn test_recv_buffer_window_invariant() {
        let mut buffer = RecvBuffer::default();
        assert_eq!(buffer.window(), RECV_BUFFER_SIZE);

        assert_eq!(buffer.enqueue_slice(b"hello"), 5);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.window() + buffer.len(), RECV_BUFFER_SIZE);

        let mut out = [0; 3];
        assert_eq!(buffer.dequeue_slice(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.window() + buffer.len(), RECV_BUFFER_SIZE);

        let mut out = [0; 8];
        assert_eq!(buffer.dequeue_slice(&mut out), 2);
        assert_eq!(&out[..2], b"lo");
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_recv_buffer_clamps_to_window() {
        let mut buffer = RecvBuffer::default();
        let chunk = vec![0xa5; RECV_BUFFER_SIZE - 1];
        assert_eq!(buffer.enqueue_slice(&chunk), RECV_BUFFER_SIZE - 1);
        // Only one octet of window remains.
        assert_eq!(buffer.enqueue_slice(b"xyz"), 1);
        assert_eq!(buffer.len(), RECV_BUFFER_SIZE);
        assert_eq!(buffer.window(), 0);
        assert_eq!(buffer.enqueue_slice(b"x"), 0);
    }
}
