//! TCP user commands (RFC 793).
//!
//! All commands block the calling thread until they can make progress or are
//! cancelled by [`Stack::interrupt`](crate::Stack::interrupt).

use core::cmp;

use crate::stack::Stack;
use crate::tcp::State;
use crate::wire::{IpEndpoint, TcpControl, IPV4_HEADER_LEN, TCP_HEADER_LEN};
use crate::{Error, Result};

impl Stack {
    /// Open a connection and return its identifier.
    ///
    /// Only passive opens are implemented: the call listens on `local`
    /// (optionally restricted to a specific `foreign` endpoint) and suspends
    /// until a peer completes the three-way handshake. Requesting an active
    /// open fails with [`Error::Illegal`].
    pub fn tcp_open(
        &self,
        local: IpEndpoint,
        foreign: Option<IpEndpoint>,
        active: bool,
    ) -> Result<usize> {
        let mut table = self.tcp.table.lock().unwrap();
        let Some(id) = table.alloc() else {
            net_debug!("out of PCB slots");
            return Err(Error::NoFreeSlot);
        };

        if active {
            net_debug!("active open is not implemented");
            self.pcb_release(&mut table, id);
            return Err(Error::Illegal);
        }

        {
            let pcb = &mut table.pcbs[id];
            pcb.local = local;
            if let Some(foreign) = foreign {
                pcb.foreign = foreign;
            }
            pcb.set_state(State::Listen);
        }
        net_debug!("passive open: local={}, waiting for connection", local);

        loop {
            // Wait for the segment-arrival processing to move the connection.
            let entered = table.pcbs[id].state;
            while table.pcbs[id].state == entered {
                let (t, interrupted) = self.pcb_sleep(id, table, None);
                table = t;
                if interrupted {
                    net_debug!("interrupted");
                    table.pcbs[id].set_state(State::Closed);
                    self.pcb_release(&mut table, id);
                    return Err(Error::Interrupted);
                }
            }
            match table.pcbs[id].state {
                State::SynReceived => continue,
                State::Established => break,
                state => {
                    net_debug!("open failed, state={}", state);
                    table.pcbs[id].set_state(State::Closed);
                    self.pcb_release(&mut table, id);
                    return Err(Error::Illegal);
                }
            }
        }

        net_debug!(
            "connection established: local={}, foreign={}",
            table.pcbs[id].local,
            table.pcbs[id].foreign
        );
        Ok(id)
    }

    /// Close a connection.
    ///
    /// The teardown is abrupt: the peer is sent a reset and the PCB is
    /// released immediately. Commands still suspended on the connection wake
    /// up and fail.
    pub fn tcp_close(&self, id: usize) -> Result<()> {
        let mut table = self.tcp.table.lock().unwrap();
        if table.get(id).is_none() {
            net_debug!("no connection with id {}", id);
            return Err(Error::Illegal);
        }
        if let Err(err) = self.tcp_output(&table.pcbs[id], TcpControl::Rst, &[]) {
            net_debug!("reset failed: {}", err);
        }
        self.pcb_release(&mut table, id);
        Ok(())
    }

    /// Send a byte stream over a connection, returning the number of octets
    /// accepted.
    ///
    /// The payload is cut into segments of at most the path MSS, each further
    /// capped by the estimated space left in the peer's receive buffer. When
    /// that estimate reaches zero the call suspends until an acceptable ACK
    /// opens the window again. An interrupt fails the call only if nothing
    /// was sent yet; otherwise the partial count is returned.
    pub fn tcp_send(&self, id: usize, data: &[u8]) -> Result<usize> {
        let mut table = self.tcp.table.lock().unwrap();
        if table.get(id).is_none() {
            net_debug!("no connection with id {}", id);
            return Err(Error::Illegal);
        }

        let mut sent = 0;
        'retry: loop {
            match table.pcbs[id].state {
                State::Established => {
                    let foreign = table.pcbs[id].foreign;
                    let Some(iface) = self.route_get_iface(foreign.addr) else {
                        net_debug!("no route to {}", foreign.addr);
                        return Err(Error::Unaddressable);
                    };
                    let mss = iface.mtu().saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN);

                    while sent < data.len() {
                        // Estimate the space left in the peer's receive
                        // buffer: its advertised window, less what is in
                        // flight.
                        let cap = {
                            let pcb = &table.pcbs[id];
                            (pcb.snd.wnd as usize).saturating_sub(pcb.snd.nxt - pcb.snd.una)
                        };
                        if cap == 0 {
                            let (t, interrupted) = self.pcb_sleep(id, table, None);
                            table = t;
                            if interrupted {
                                net_debug!("interrupted");
                                if sent == 0 {
                                    return Err(Error::Interrupted);
                                }
                                return Ok(sent);
                            }
                            continue 'retry;
                        }

                        let len = cmp::min(cmp::min(mss, data.len() - sent), cap);
                        if let Err(err) = self.tcp_output(
                            &table.pcbs[id],
                            TcpControl::Psh,
                            &data[sent..sent + len],
                        ) {
                            net_debug!("transmit failed: {}", err);
                            table.pcbs[id].set_state(State::Closed);
                            self.pcb_release(&mut table, id);
                            return Err(err);
                        }
                        let pcb = &mut table.pcbs[id];
                        pcb.snd.nxt = pcb.snd.nxt + len;
                        sent += len;
                    }
                    return Ok(sent);
                }
                State::Closed => {
                    // Torn down while suspended; finish the deferred release.
                    net_debug!("connection closed");
                    self.pcb_release(&mut table, id);
                    return Err(Error::Illegal);
                }
                state => {
                    net_debug!("invalid state {}", state);
                    return Err(Error::Illegal);
                }
            }
        }
    }

    /// Receive from a connection into `buffer`, returning the number of
    /// octets delivered.
    ///
    /// Delivers at most `buffer.len()` octets from the head of the receive
    /// buffer and grows the advertised window by the same amount. Suspends
    /// while no data is buffered.
    pub fn tcp_receive(&self, id: usize, buffer: &mut [u8]) -> Result<usize> {
        let mut table = self.tcp.table.lock().unwrap();
        if table.get(id).is_none() {
            net_debug!("no connection with id {}", id);
            return Err(Error::Illegal);
        }

        loop {
            match table.pcbs[id].state {
                State::Established => {
                    if table.pcbs[id].buf.len() == 0 {
                        let (t, interrupted) = self.pcb_sleep(id, table, None);
                        table = t;
                        if interrupted {
                            net_debug!("interrupted");
                            return Err(Error::Interrupted);
                        }
                        continue;
                    }
                    let pcb = &mut table.pcbs[id];
                    let len = pcb.buf.dequeue_slice(buffer);
                    pcb.rcv.wnd = pcb.buf.window() as u16;
                    return Ok(len);
                }
                State::Closed => {
                    // Torn down while suspended; finish the deferred release.
                    net_debug!("connection closed");
                    self.pcb_release(&mut table, id);
                    return Err(Error::Illegal);
                }
                state => {
                    net_debug!("invalid state {}", state);
                    return Err(Error::Illegal);
                }
            }
        }
    }

    /// Return the state of a connection, for diagnostics and tests.
    pub fn tcp_state(&self, id: usize) -> Result<State> {
        let table = self.tcp.table.lock().unwrap();
        table.get(id).map(|pcb| pcb.state).ok_or(Error::Illegal)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::phy::Loopback;
    use crate::stack::Stack;
    use crate::tcp::{State, PCB_COUNT};
    use crate::wire::{
        IpEndpoint, Ipv4Address, Ipv4Packet, TcpPacket, TcpSeqNumber,
    };
    use crate::Error;

    const LOCAL_ADDR: Ipv4Address = Ipv4Address([10, 0, 0, 2]);
    const PEER_ADDR: Ipv4Address = Ipv4Address([10, 0, 0, 1]);
    const NETMASK: Ipv4Address = Ipv4Address([255, 255, 255, 0]);

    fn stack_with_mtu(mtu: usize) -> (Arc<Stack>, Arc<Loopback>) {
        let stack = Arc::new(Stack::new());
        let device = Arc::new(Loopback::with_mtu(mtu));
        stack
            .add_interface(device.clone(), LOCAL_ADDR, NETMASK)
            .unwrap();
        (stack, device)
    }

    /// Put a freshly allocated PCB straight into ESTABLISHED.
    fn established(stack: &Stack, peer_window: u16) -> usize {
        let mut table = stack.tcp.table.lock().unwrap();
        let id = table.alloc().unwrap();
        let pcb = &mut table.pcbs[id];
        pcb.state = State::Established;
        pcb.local = IpEndpoint::new(LOCAL_ADDR, 80);
        pcb.foreign = IpEndpoint::new(PEER_ADDR, 49500);
        pcb.iss = TcpSeqNumber::from_raw(9000);
        pcb.snd.una = pcb.iss + 1;
        pcb.snd.nxt = pcb.iss + 1;
        pcb.snd.wnd = peer_window;
        pcb.irs = TcpSeqNumber::from_raw(1000);
        pcb.rcv.nxt = pcb.irs + 1;
        pcb.rcv.wnd = pcb.buf.window() as u16;
        id
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn waiter_count(stack: &Stack, id: usize) -> usize {
        stack.tcp.table.lock().unwrap().pcbs[id].waiters
    }

    fn payload_of(frame: &[u8]) -> Vec<u8> {
        let packet = Ipv4Packet::new_checked(frame).unwrap();
        let tcp = TcpPacket::new_checked(packet.payload()).unwrap();
        tcp.payload().to_vec()
    }

    #[test]
    fn test_open_exhausts_slots() {
        let (stack, _device) = stack_with_mtu(1500);
        {
            let mut table = stack.tcp.table.lock().unwrap();
            for _ in 0..PCB_COUNT {
                table.alloc().unwrap();
            }
        }
        assert_eq!(
            stack.tcp_open(IpEndpoint::new(LOCAL_ADDR, 80), None, false),
            Err(Error::NoFreeSlot)
        );
    }

    #[test]
    fn test_open_active_unsupported() {
        let (stack, _device) = stack_with_mtu(1500);
        assert_eq!(
            stack.tcp_open(
                IpEndpoint::new(LOCAL_ADDR, 80),
                Some(IpEndpoint::new(PEER_ADDR, 80)),
                true
            ),
            Err(Error::Illegal)
        );
        // The slot taken during the attempt is free again.
        let table = stack.tcp.table.lock().unwrap();
        assert!(table.pcbs.iter().all(|pcb| pcb.state == State::Free));
    }

    #[test]
    fn test_open_interrupted() {
        let (stack, _device) = stack_with_mtu(1500);
        let opener = {
            let stack = stack.clone();
            thread::spawn(move || stack.tcp_open(IpEndpoint::new(LOCAL_ADDR, 80), None, false))
        };
        wait_until(|| waiter_count(&stack, 0) == 1);

        stack.interrupt();
        assert_eq!(opener.join().unwrap(), Err(Error::Interrupted));
        let table = stack.tcp.table.lock().unwrap();
        assert_eq!(table.pcbs[0].state, State::Free);
    }

    #[test]
    fn test_close_resets_peer_and_frees_slot() {
        let (stack, device) = stack_with_mtu(1500);
        let id = established(&stack, 4096);

        assert_eq!(stack.tcp_close(id), Ok(()));

        let frame = device.receive().unwrap();
        let packet = Ipv4Packet::new_checked(&frame[..]).unwrap();
        let tcp = TcpPacket::new_checked(packet.payload()).unwrap();
        assert!(tcp.rst());
        assert_eq!(tcp.seq_number(), TcpSeqNumber::from_raw(9001));

        assert_eq!(stack.tcp_state(id), Err(Error::Illegal));
        assert_eq!(stack.tcp_send(id, b"x"), Err(Error::Illegal));
    }

    #[test]
    fn test_close_unknown_id() {
        let (stack, _device) = stack_with_mtu(1500);
        assert_eq!(stack.tcp_close(3), Err(Error::Illegal));
        assert_eq!(stack.tcp_close(PCB_COUNT + 1), Err(Error::Illegal));
    }

    #[test]
    fn test_send_fragments_at_mss() {
        let (stack, device) = stack_with_mtu(1500);
        let id = established(&stack, 65535);
        let data = vec![0x5a; 3000];

        assert_eq!(stack.tcp_send(id, &data), Ok(3000));

        // MSS is 1500 - 40; the last segment carries the remainder.
        assert_eq!(payload_of(&device.receive().unwrap()).len(), 1460);
        assert_eq!(payload_of(&device.receive().unwrap()).len(), 1460);
        assert_eq!(payload_of(&device.receive().unwrap()).len(), 80);
        assert!(device.receive().is_none());

        let table = stack.tcp.table.lock().unwrap();
        let pcb = &table.pcbs[id];
        assert_eq!(pcb.snd.nxt, pcb.iss + 1 + 3000);
    }

    #[test]
    fn test_send_sets_psh_ack() {
        let (stack, device) = stack_with_mtu(1500);
        let id = established(&stack, 4096);

        assert_eq!(stack.tcp_send(id, b"hello"), Ok(5));

        let frame = device.receive().unwrap();
        let packet = Ipv4Packet::new_checked(&frame[..]).unwrap();
        let tcp = TcpPacket::new_checked(packet.payload()).unwrap();
        assert!(tcp.psh());
        assert!(tcp.ack());
        assert_eq!(tcp.seq_number(), TcpSeqNumber::from_raw(9001));
        assert_eq!(tcp.ack_number(), TcpSeqNumber::from_raw(1001));
        assert_eq!(tcp.payload(), b"hello");
    }

    #[test]
    fn test_send_blocks_on_zero_window() {
        let (stack, device) = stack_with_mtu(1500);
        let id = established(&stack, 0);

        let sender = {
            let stack = stack.clone();
            thread::spawn(move || stack.tcp_send(id, b"payload"))
        };
        wait_until(|| waiter_count(&stack, id) == 1);
        assert!(device.receive().is_none());

        stack.interrupt();
        assert_eq!(sender.join().unwrap(), Err(Error::Interrupted));
        // Unlike open, an interrupted send leaves the connection up.
        assert_eq!(stack.tcp_state(id), Ok(State::Established));
    }

    #[test]
    fn test_send_wrong_state() {
        let (stack, _device) = stack_with_mtu(1500);
        let id = {
            let mut table = stack.tcp.table.lock().unwrap();
            let id = table.alloc().unwrap();
            table.pcbs[id].state = State::Listen;
            table.pcbs[id].local = IpEndpoint::new(LOCAL_ADDR, 80);
            id
        };
        assert_eq!(stack.tcp_send(id, b"x"), Err(Error::Illegal));
        assert_eq!(stack.tcp_send(PCB_COUNT + 1, b"x"), Err(Error::Illegal));
    }

    #[test]
    fn test_receive_drains_buffer() {
        let (stack, _device) = stack_with_mtu(1500);
        let id = established(&stack, 4096);
        {
            let mut table = stack.tcp.table.lock().unwrap();
            let pcb = &mut table.pcbs[id];
            pcb.buf.enqueue_slice(b"hello world");
            pcb.rcv.wnd = pcb.buf.window() as u16;
        }

        let mut buffer = [0; 8];
        assert_eq!(stack.tcp_receive(id, &mut buffer), Ok(8));
        assert_eq!(&buffer, b"hello wo");

        let mut buffer = [0; 64];
        assert_eq!(stack.tcp_receive(id, &mut buffer), Ok(3));
        assert_eq!(&buffer[..3], b"rld");

        let table = stack.tcp.table.lock().unwrap();
        assert_eq!(table.pcbs[id].rcv.wnd as usize, table.pcbs[id].buf.window());
        assert_eq!(table.pcbs[id].buf.len(), 0);
    }

    #[test]
    fn test_receive_interrupted_leaves_connection_up() {
        let (stack, _device) = stack_with_mtu(1500);
        let id = established(&stack, 4096);

        let receiver = {
            let stack = stack.clone();
            thread::spawn(move || {
                let mut buffer = [0; 16];
                stack.tcp_receive(id, &mut buffer)
            })
        };
        wait_until(|| waiter_count(&stack, id) == 1);

        stack.interrupt();
        assert_eq!(receiver.join().unwrap(), Err(Error::Interrupted));
        assert_eq!(stack.tcp_state(id), Ok(State::Established));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let (stack, _device) = stack_with_mtu(1500);
        let id = established(&stack, 4096);

        let receiver = {
            let stack = stack.clone();
            thread::spawn(move || {
                let mut buffer = [0; 16];
                stack.tcp_receive(id, &mut buffer)
            })
        };
        wait_until(|| waiter_count(&stack, id) == 1);

        // The receiver is still suspended, so release is deferred to it.
        assert_eq!(stack.tcp_close(id), Ok(()));
        assert_eq!(receiver.join().unwrap(), Err(Error::Illegal));

        // The waiter completed the teardown on its way out.
        let table = stack.tcp.table.lock().unwrap();
        assert_eq!(table.pcbs[id].state, State::Free);
        assert_eq!(table.pcbs[id].waiters, 0);
    }

    #[test]
    fn test_receive_wrong_state() {
        let (stack, _device) = stack_with_mtu(1500);
        let mut buffer = [0; 16];
        assert_eq!(stack.tcp_receive(0, &mut buffer), Err(Error::Illegal));
    }
}
