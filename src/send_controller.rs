use std::net::SocketAddr;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::packet::{GrantPacket, HomaPacket, PacketKind, RequestPacket, SchedDataPacket, UnschedDataPacket};
use crate::priority_resolver::PriorityResolver;
use crate::safe_converter::PrecheckedCast;
use crate::unsched_byte_allocator::UnschedByteAllocator;

/// A message that still has scheduled bytes to send, waiting for grants from the receiver
pub struct OutboundMessage {
    msg_id: u64,
    destination: SocketAddr,
    data: Bytes,
    next_byte_to_send: u32,
    bytes_left: u32,
    created_at: Instant,
}

impl OutboundMessage {
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn msg_size(&self) -> u32 {
        self.data.len().prechecked_cast()
    }

    /// bytes sent so far, unscheduled and scheduled
    pub fn bytes_sent(&self) -> u32 {
        self.next_byte_to_send
    }

    pub fn bytes_left(&self) -> u32 {
        self.bytes_left
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// The sender side of the protocol: It splits messages into packets, sending the unscheduled part
///  right away and the rest in response to grants.
pub struct SendController {
    local_addr: SocketAddr,
    next_msg_id: u64,
    unsched_byte_allocator: UnschedByteAllocator,
    outbound: FxHashMap<u64, OutboundMessage>,
}

impl SendController {
    pub fn new(local_addr: SocketAddr, unsched_byte_allocator: UnschedByteAllocator, first_msg_id: u64) -> SendController {
        SendController {
            local_addr,
            next_msg_id: first_msg_id,
            unsched_byte_allocator,
            outbound: Default::default(),
        }
    }

    pub fn num_outbound_messages(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound_message(&self, msg_id: u64) -> Option<&OutboundMessage> {
        self.outbound.get(&msg_id)
    }

    /// Starts sending a message, returning its id and the Request and unscheduled data packets
    ///  to send immediately. The message's remaining bytes are sent in response to grants.
    pub fn send_message(&mut self, now: Instant, destination: SocketAddr, data: Bytes, prio_resolver: &PriorityResolver) -> anyhow::Result<(u64, Vec<HomaPacket>)> {
        if data.is_empty() {
            bail!("empty messages are not supported");
        }
        let msg_size: u32 = match data.len().try_into() {
            Ok(len) => len,
            Err(_) => bail!("message size {} exceeds the maximum of {} bytes", data.len(), u32::MAX),
        };

        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);

        let pkt_sizes = self.unsched_byte_allocator.req_unsched_data_pkts(destination, msg_size);
        let total_unsched_bytes: u32 = pkt_sizes.iter().sum();
        let req_bytes = pkt_sizes[0];
        let prios = prio_resolver.unsched_pkts_prio(msg_size, &pkt_sizes);

        let mut packets = Vec::with_capacity(pkt_sizes.len());
        packets.push(self.packet(destination, msg_id, prios[0], PacketKind::Request(RequestPacket {
            msg_byte_len: msg_size,
            total_unsched_bytes,
            unsched_prio: prios.get(1).copied().unwrap_or(prios[0]),
            data: data.slice(..req_bytes as usize),
        })));

        let mut first_byte = req_bytes;
        for (&pkt_bytes, &prio) in pkt_sizes[1..].iter().zip(&prios[1..]) {
            let range = first_byte as usize..(first_byte + pkt_bytes) as usize;
            packets.push(self.packet(destination, msg_id, prio, PacketKind::UnschedData(UnschedDataPacket {
                msg_byte_len: msg_size,
                req_bytes: req_bytes.prechecked_cast(),
                total_unsched_bytes,
                first_byte,
                data: data.slice(range),
            })));
            first_byte += pkt_bytes;
        }

        let bytes_left = msg_size - total_unsched_bytes;
        debug!("sending message #{} of {} bytes to {:?}: {} request bytes, {} unscheduled bytes, {} scheduled bytes", msg_id, msg_size, destination, req_bytes, total_unsched_bytes - req_bytes, bytes_left);

        if bytes_left > 0 {
            self.outbound.insert(msg_id, OutboundMessage {
                msg_id,
                destination,
                data,
                next_byte_to_send: total_unsched_bytes,
                bytes_left,
                created_at: now,
            });
        }
        Ok((msg_id, packets))
    }

    /// Sends the bytes granted by a receiver as a single ScheduledData packet
    pub fn process_received_grant(&mut self, grant_packet: &HomaPacket) -> anyhow::Result<HomaPacket> {
        let PacketKind::Grant(GrantPacket { grant_bytes, sched_prio }) = grant_packet.kind else {
            bail!("this is a bug: {:?} is not a grant", grant_packet);
        };

        let Some(msg) = self.outbound.get_mut(&grant_packet.msg_id) else {
            bail!("received {:?} for unknown message #{}", grant_packet, grant_packet.msg_id);
        };
        if grant_packet.source != msg.destination || grant_packet.destination != self.local_addr {
            bail!("addresses of {:?} to {:?} do not match message #{} to {:?}", grant_packet, grant_packet.destination, msg.msg_id, msg.destination);
        }

        let bytes_to_send = u32::from(grant_bytes).min(msg.bytes_left);
        if bytes_to_send == 0 {
            bail!("received {:?} without granted bytes", grant_packet);
        }

        let first_byte = msg.next_byte_to_send;
        let data = msg.data.slice(first_byte as usize..(first_byte + bytes_to_send) as usize);
        msg.next_byte_to_send += bytes_to_send;
        msg.bytes_left -= bytes_to_send;
        trace!("message #{}: sending {} granted bytes, {} bytes left", msg.msg_id, bytes_to_send, msg.bytes_left);

        let destination = msg.destination;
        if msg.bytes_left == 0 {
            debug!("message #{} to {:?} is sent completely", grant_packet.msg_id, destination);
            self.outbound.remove(&grant_packet.msg_id);
        }

        self.unsched_byte_allocator.update_req_data_bytes(grant_packet);
        self.unsched_byte_allocator.update_unsched_bytes(grant_packet);

        Ok(self.packet(destination, grant_packet.msg_id, sched_prio, PacketKind::SchedData(SchedDataPacket {
            first_byte,
            data,
        })))
    }

    /// Stops sending a message. Returns `false` if there was no such message.
    pub fn abandon(&mut self, msg_id: u64) -> bool {
        let abandoned = self.outbound.remove(&msg_id).is_some();
        if abandoned {
            debug!("abandoned outbound message #{}", msg_id);
        }
        abandoned
    }

    fn packet(&self, destination: SocketAddr, msg_id: u64, priority: u8, kind: PacketKind) -> HomaPacket {
        HomaPacket {
            source: self.local_addr,
            destination,
            msg_id,
            priority,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HomaConfig, PrioResolutionMode};
    use crate::workload_estimator::WorkloadEstimator;
    use rstest::rstest;

    fn local() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 9000))
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 9000))
    }

    fn resolver() -> PriorityResolver {
        let mut config = HomaConfig::default_config(local());
        config.prio_resolution_mode = PrioResolutionMode::Explicit(vec![5000]);
        PriorityResolver::new(&config, &WorkloadEstimator::observed(1, u32::MAX))
    }

    fn controller() -> SendController {
        SendController::new(local(), UnschedByteAllocator::new(1400, 5776).unwrap(), 17)
    }

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn grant(msg_id: u64, grant_bytes: u16, sched_prio: u8) -> HomaPacket {
        HomaPacket {
            source: peer(),
            destination: local(),
            msg_id,
            priority: 0,
            kind: PacketKind::Grant(GrantPacket { grant_bytes, sched_prio }),
        }
    }

    #[rstest]
    #[case::request_only(1000, vec![1000], vec![0], 0)]
    #[case::unsched(3000, vec![1400, 1444, 156], vec![0, 0, 0], 0)]
    #[case::sched(15000, vec![1400, 1444, 1444, 1444, 1444], vec![1, 1, 1, 1, 1], 15000 - 1400 - 5776)]
    #[case::prio_graduated_by_remaining_bytes(7000, vec![1400, 1444, 1444, 1444, 1268], vec![1, 1, 0, 0, 0], 0)]
    fn test_send_message(#[case] msg_size: usize, #[case] expected_pkt_sizes: Vec<u32>, #[case] expected_prios: Vec<u8>, #[case] expected_bytes_left: u32) {
        let mut controller = controller();
        let data = payload(msg_size);
        let (msg_id, packets) = controller.send_message(Instant::now(), peer(), data.clone(), &resolver()).unwrap();
        assert_eq!(msg_id, 17);

        let pkt_sizes = packets.iter().map(|p| p.data_bytes()).collect::<Vec<_>>();
        assert_eq!(pkt_sizes, expected_pkt_sizes);

        let total_unsched_bytes: u32 = expected_pkt_sizes.iter().sum();
        let mut reassembled = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.source, local());
            assert_eq!(p.destination, peer());
            assert_eq!(p.msg_id, 17);
            assert_eq!(p.priority, expected_prios[i]);
            match &p.kind {
                PacketKind::Request(r) => {
                    assert_eq!(i, 0);
                    assert_eq!(r.unsched_prio, expected_prios.get(1).copied().unwrap_or(expected_prios[0]));
                    assert_eq!(r.msg_byte_len, msg_size as u32);
                    assert_eq!(r.total_unsched_bytes, total_unsched_bytes);
                    reassembled.extend_from_slice(&r.data);
                }
                PacketKind::UnschedData(u) => {
                    assert!(i > 0);
                    assert_eq!(u.first_byte as usize, reassembled.len());
                    assert_eq!(u.req_bytes as u32, expected_pkt_sizes[0]);
                    reassembled.extend_from_slice(&u.data);
                }
                _ => panic!("unexpected packet {:?}", p),
            }
        }
        assert_eq!(&reassembled, &data[..total_unsched_bytes as usize]);

        match controller.outbound_message(17) {
            Some(msg) => {
                assert_eq!(msg.bytes_left(), expected_bytes_left);
                assert_eq!(msg.bytes_sent() + msg.bytes_left(), msg.msg_size());
            }
            None => assert_eq!(expected_bytes_left, 0),
        }
    }

    #[test]
    fn test_msg_ids_are_consecutive() {
        let mut controller = controller();
        let resolver = resolver();
        let (id1, _) = controller.send_message(Instant::now(), peer(), payload(10), &resolver).unwrap();
        let (id2, _) = controller.send_message(Instant::now(), peer(), payload(10), &resolver).unwrap();
        assert_eq!(id2, id1 + 1);
    }

    #[test]
    fn test_msg_id_wraps_around() {
        let mut controller = SendController::new(local(), UnschedByteAllocator::new(1400, 5776).unwrap(), u64::MAX);
        let resolver = resolver();
        let (id1, _) = controller.send_message(Instant::now(), peer(), payload(10), &resolver).unwrap();
        let (id2, _) = controller.send_message(Instant::now(), peer(), payload(10), &resolver).unwrap();
        assert_eq!((id1, id2), (u64::MAX, 0));
    }

    #[test]
    fn test_empty_message() {
        assert!(controller().send_message(Instant::now(), peer(), Bytes::new(), &resolver()).is_err());
    }

    #[test]
    fn test_grants() {
        let mut controller = controller();
        let data = payload(10_000);
        let (msg_id, _) = controller.send_message(Instant::now(), peer(), data.clone(), &resolver()).unwrap();

        // 10_000 - 1400 - 5776 = 2824 scheduled bytes
        let p = controller.process_received_grant(&grant(msg_id, 1454, 6)).unwrap();
        assert_eq!(p.priority, 6);
        assert_eq!(p.destination, peer());
        let PacketKind::SchedData(sched) = &p.kind else { panic!() };
        assert_eq!(sched.first_byte, 7176);
        assert_eq!(&sched.data[..], &data[7176..8630]);
        assert_eq!(controller.outbound_message(msg_id).map(|m| m.bytes_left()), Some(1370));

        // the grant exceeds the remaining bytes
        let p = controller.process_received_grant(&grant(msg_id, 1454, 7)).unwrap();
        let PacketKind::SchedData(sched) = &p.kind else { panic!() };
        assert_eq!(sched.first_byte, 8630);
        assert_eq!(&sched.data[..], &data[8630..]);
        assert!(controller.outbound_message(msg_id).is_none());
        assert_eq!(controller.num_outbound_messages(), 0);
    }

    #[test]
    fn test_grant_for_unknown_message() {
        let mut controller = controller();
        assert!(controller.process_received_grant(&grant(99, 1000, 6)).is_err());
    }

    #[test]
    fn test_grant_from_wrong_peer() {
        let mut controller = controller();
        let (msg_id, _) = controller.send_message(Instant::now(), peer(), payload(10_000), &resolver()).unwrap();

        let mut grant = grant(msg_id, 1000, 6);
        grant.source = SocketAddr::from(([10, 0, 0, 3], 9000));
        assert!(controller.process_received_grant(&grant).is_err());
    }

    #[test]
    fn test_abandon() {
        let mut controller = controller();
        let (msg_id, _) = controller.send_message(Instant::now(), peer(), payload(10_000), &resolver()).unwrap();
        assert!(controller.abandon(msg_id));
        assert!(!controller.abandon(msg_id));
        assert!(controller.process_received_grant(&grant(msg_id, 1000, 6)).is_err());
    }
}
