use crate::stack::Stack;
use crate::tcp::{PcbTable, State};
use crate::wire::{
    IpEndpoint, Ipv4Address, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, IPV4_HEADER_LEN,
    TCP_HEADER_LEN,
};
use crate::{Error, Result};

impl Stack {
    /// Process a TCP segment received for the given addresses.
    pub(crate) fn tcp_input(&self, data: &[u8], src: Ipv4Address, dst: Ipv4Address) -> Result<()> {
        let packet = TcpPacket::new_checked(data)?;
        let repr = TcpRepr::parse(&packet, &src, &dst)?;

        if src.is_broadcast() || dst.is_broadcast() {
            net_debug!("broadcast address in segment: src={}, dst={}", src, dst);
            return Err(Error::Unaddressable);
        }

        let local = IpEndpoint::new(dst, repr.dst_port);
        let foreign = IpEndpoint::new(src, repr.src_port);
        net_trace!("{} => {}, {}", foreign, local, repr);

        let mut table = self.tcp.table.lock().unwrap();
        self.tcp_segment_arrives(&mut table, &repr, &local, &foreign);
        Ok(())
    }

    /// RFC 793 section 3.9, SEGMENT ARRIVES.
    ///
    /// The checks run in the order the RFC prescribes: an unacceptable
    /// segment must not alter connection state, and the ACK field must not be
    /// processed before sequence acceptability is confirmed.
    fn tcp_segment_arrives(
        &self,
        table: &mut PcbTable,
        repr: &TcpRepr,
        local: &IpEndpoint,
        foreign: &IpEndpoint,
    ) {
        let seg_len = repr.segment_len();

        let id = match table.select(local, Some(foreign)) {
            Some(id) if table.pcbs[id].state != State::Closed => id,
            _ => {
                // No connection owns this segment. An incoming reset is
                // dropped silently; anything else is answered with one.
                if repr.control == TcpControl::Rst {
                    return;
                }
                let result = match repr.ack_number {
                    Some(ack) => self
                        .tcp_output_segment(ack, None, TcpControl::Rst, 0, &[], local, foreign),
                    None => self.tcp_output_segment(
                        TcpSeqNumber(0),
                        Some(repr.seq_number + seg_len),
                        TcpControl::Rst,
                        0,
                        &[],
                        local,
                        foreign,
                    ),
                };
                if let Err(err) = result {
                    net_debug!("reset reply failed: {}", err);
                }
                return;
            }
        };

        match table.pcbs[id].state {
            State::Listen => {
                // 1st, check for a RST: ignored.
                if repr.control == TcpControl::Rst {
                    return;
                }

                // 2nd, check for an ACK: nothing can have been acknowledged
                // yet, so answer with a reset.
                if let Some(ack) = repr.ack_number {
                    if let Err(err) =
                        self.tcp_output_segment(ack, None, TcpControl::Rst, 0, &[], local, foreign)
                    {
                        net_debug!("reset reply failed: {}", err);
                    }
                    return;
                }

                // 3rd, check for a SYN.
                if repr.control == TcpControl::Syn {
                    let mtu = self
                        .route_get_iface(foreign.addr)
                        .map_or(0, |iface| iface.mtu().min(u16::MAX as usize) as u16);

                    let pcb = &mut table.pcbs[id];
                    // Both ends of the connection are known now.
                    pcb.local = *local;
                    pcb.foreign = *foreign;
                    pcb.rcv.wnd = pcb.buf.window() as u16;
                    pcb.rcv.nxt = repr.seq_number + 1;
                    pcb.irs = repr.seq_number;
                    pcb.iss = TcpSeqNumber(rand::random());
                    pcb.mtu = mtu;
                    pcb.mss = mtu.saturating_sub((IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16);
                    net_debug!(
                        "received SYN from {}, irs={}, mtu={}, mss={}",
                        foreign,
                        pcb.irs,
                        pcb.mtu,
                        pcb.mss
                    );
                    if let Err(err) = self.tcp_output(pcb, TcpControl::Syn, &[]) {
                        net_debug!("transmit failed: {}", err);
                    }
                    let pcb = &mut table.pcbs[id];
                    pcb.snd.nxt = pcb.iss + 1;
                    pcb.snd.una = pcb.iss;
                    pcb.set_state(State::SynReceived);
                    return;
                }

                // 4th, other text or control: drop.
                return;
            }
            State::SynSent => {
                // Active opens are not implemented, so no segment can be
                // matched against a SYN of ours; drop.
                return;
            }
            _ => (),
        }

        // Otherwise,
        //
        // 1st, check the sequence number.
        let acceptable = {
            let pcb = &table.pcbs[id];
            let seq = repr.seq_number;
            let nxt = pcb.rcv.nxt;
            let wnd = pcb.rcv.wnd as usize;
            if seg_len == 0 {
                if wnd == 0 {
                    seq == nxt
                } else {
                    nxt <= seq && seq < nxt + wnd
                }
            } else if wnd == 0 {
                false
            } else {
                // Acceptable if either edge of the segment lies in the
                // window. There is no reassembly queue, so whatever is
                // accepted here is buffered as is.
                let last = seq + (seg_len - 1);
                (nxt <= seq && seq < nxt + wnd) || (nxt <= last && last < nxt + wnd)
            }
        };
        if !acceptable {
            if repr.control != TcpControl::Rst {
                if let Err(err) = self.tcp_output(&table.pcbs[id], TcpControl::None, &[]) {
                    net_debug!("transmit failed: {}", err);
                }
            }
            return;
        }

        // 2nd, check the RST bit: connection reset is not implemented.

        // 3rd, check security and precedence: ignored.

        // 4th, check the SYN bit: a SYN in the window is not handled.

        // 5th, check the ACK field.
        let Some(ack) = repr.ack_number else {
            return;
        };
        if table.pcbs[id].state == State::SynReceived {
            let pcb = &mut table.pcbs[id];
            if pcb.snd.una <= ack && ack <= pcb.snd.nxt {
                pcb.set_state(State::Established);
                self.pcb_wake(id);
                // Processing continues below as for ESTABLISHED.
            } else {
                if let Err(err) =
                    self.tcp_output_segment(ack, None, TcpControl::Rst, 0, &[], local, foreign)
                {
                    net_debug!("reset reply failed: {}", err);
                }
                return;
            }
        }
        if table.pcbs[id].state == State::Established {
            let pcb = &mut table.pcbs[id];
            if pcb.snd.una < ack && ack <= pcb.snd.nxt {
                pcb.snd.una = ack;
                // Update the send window, unless the segment is older than
                // the one that last updated it.
                if pcb.snd.wl1 < repr.seq_number
                    || (pcb.snd.wl1 == repr.seq_number && pcb.snd.wl2 <= ack)
                {
                    pcb.snd.wnd = repr.window_len;
                    pcb.snd.wl1 = repr.seq_number;
                    pcb.snd.wl2 = ack;
                }
                // A sender may be suspended on the window.
                self.pcb_wake(id);
            } else if ack < pcb.snd.una {
                // Duplicate of something already acknowledged; ignore.
            } else if ack > pcb.snd.nxt {
                // Acknowledges data that was never sent.
                if let Err(err) = self.tcp_output(pcb, TcpControl::None, &[]) {
                    net_debug!("transmit failed: {}", err);
                }
                return;
            }
        }

        // 6th, check the URG bit: ignored.

        // 7th, process the segment text.
        if table.pcbs[id].state == State::Established && !repr.payload.is_empty() {
            let pcb = &mut table.pcbs[id];
            let accepted = pcb.buf.enqueue_slice(repr.payload);
            if accepted < repr.payload.len() {
                net_debug!(
                    "receive buffer full, {} octets dropped",
                    repr.payload.len() - accepted
                );
            }
            pcb.rcv.nxt = repr.seq_number + seg_len;
            pcb.rcv.wnd = pcb.buf.window() as u16;
            if let Err(err) = self.tcp_output(pcb, TcpControl::None, &[]) {
                net_debug!("transmit failed: {}", err);
            }
            self.pcb_wake(id);
        }

        // 8th, check the FIN bit: connection teardown is not implemented.
    }
}
