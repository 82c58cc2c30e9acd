use crate::stack::Stack;
use crate::tcp::Pcb;
use crate::wire::{IpEndpoint, IpProtocol, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber};
use crate::Result;

impl Stack {
    /// Build a segment and emit it through IP.
    pub(crate) fn tcp_output_segment(
        &self,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        control: TcpControl,
        window: u16,
        payload: &[u8],
        local: &IpEndpoint,
        foreign: &IpEndpoint,
    ) -> Result<()> {
        let repr = TcpRepr {
            src_port: local.port,
            dst_port: foreign.port,
            control,
            seq_number: seq,
            ack_number: ack,
            window_len: window,
            payload,
        };

        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = TcpPacket::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet, &local.addr, &foreign.addr);

        net_trace!("{} => {}, {}", local, foreign, repr);
        self.ip_output(IpProtocol::Tcp, &bytes, local.addr, foreign.addr)
    }

    /// Emit a segment carrying the current state of the connection.
    ///
    /// A SYN is sent with the initial send sequence number, everything else
    /// with `SND.NXT`; the caller advances `SND.NXT` itself. Segments that
    /// carry SYN, FIN or payload would also enter a retransmission queue, if
    /// this stack had one.
    pub(crate) fn tcp_output(&self, pcb: &Pcb, control: TcpControl, payload: &[u8]) -> Result<()> {
        let seq = match control {
            TcpControl::Syn => pcb.iss,
            _ => pcb.snd.nxt,
        };
        self.tcp_output_segment(
            seq,
            Some(pcb.rcv.nxt),
            control,
            pcb.rcv.wnd,
            payload,
            &pcb.local,
            &pcb.foreign,
        )
    }
}
