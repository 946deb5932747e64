use std::collections::BTreeSet;
use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::byte_bucket::ByteBucket;
use crate::config::HomaConfig;
use crate::message_key::{MessageKey, MessageRank};
use crate::packet::{bytes_on_wire, GrantPacket, HomaPacket, PacketKind, PacketType};
use crate::priority_resolver::PriorityResolver;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::traffic_pacer::{GrantDecision, TrafficPacer};

/// Grants are sent at the highest priority
const GRANT_PRIO: u8 = 0;

/// A completely received message
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub sender: SocketAddr,
    pub msg_id: u64,
    pub data: Bytes,
}

/// A partially received message
pub struct InboundMessage {
    key: MessageKey,
    msg_size: u32,
    total_unsched_bytes: u32,
    bytes_to_grant: u32,
    bytes_granted_in_flight: u32,
    bytes_to_receive: u32,
    data: BytesMut,
    created_at: Instant,
    last_grant_at: Option<Instant>,
}

impl InboundMessage {
    fn new(key: MessageKey, msg_size: u32, total_unsched_bytes: u32, now: Instant) -> InboundMessage {
        InboundMessage {
            key,
            msg_size,
            total_unsched_bytes,
            bytes_to_grant: msg_size - total_unsched_bytes,
            bytes_granted_in_flight: 0,
            bytes_to_receive: msg_size,
            data: BytesMut::zeroed(msg_size.safe_cast()),
            created_at: now,
            last_grant_at: None,
        }
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn msg_size(&self) -> u32 {
        self.msg_size
    }

    pub fn bytes_received(&self) -> u32 {
        self.msg_size - self.bytes_to_receive
    }

    pub fn bytes_to_receive(&self) -> u32 {
        self.bytes_to_receive
    }

    pub fn bytes_to_grant(&self) -> u32 {
        self.bytes_to_grant
    }

    pub fn bytes_granted_in_flight(&self) -> u32 {
        self.bytes_granted_in_flight
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_grant_at(&self) -> Option<Instant> {
        self.last_grant_at
    }

    fn rank(&self) -> MessageRank {
        MessageRank {
            bytes_to_grant: self.bytes_to_grant,
            msg_size: self.msg_size,
            key: self.key,
        }
    }

    fn apply_data(&mut self, first_byte: u32, data: &[u8]) -> anyhow::Result<()> {
        let len: u32 = data.len().prechecked_cast();
        if first_byte as u64 + len as u64 > self.msg_size as u64 {
            bail!("data [{}+{}] exceeds message {:?} of {} bytes", first_byte, len, self.key, self.msg_size);
        }
        if len > self.bytes_to_receive {
            bail!("received more data than expected for {:?}: {} bytes, {} bytes to receive", self.key, len, self.bytes_to_receive);
        }

        let start: usize = first_byte.safe_cast();
        self.data[start..start + data.len()].copy_from_slice(data);
        self.bytes_to_receive -= len;
        Ok(())
    }
}

/// Outcome of a grant round: the grants to send, and the point in time at which the next grant
///  round should happen. `None` means there is nothing to grant until more packets arrive.
#[derive(Debug)]
pub struct GrantRound {
    pub grants: Vec<HomaPacket>,
    pub next_grant_time: Option<Instant>,
}

/// The receiver side of the protocol: It reassembles inbound messages and decides which sender
///  to grant how many bytes.
pub struct ReceiveScheduler {
    local_addr: SocketAddr,
    grant_max_bytes: u32,
    max_message_bytes: u32,
    num_senders_to_keep_granted: usize,
    inbound: FxHashMap<MessageKey, InboundMessage>,
    /// messages with bytes left to grant, in SRPT order
    grant_queue: BTreeSet<MessageRank>,
    byte_bucket: ByteBucket,
    traffic_pacer: TrafficPacer,
}

impl ReceiveScheduler {
    /// `grant_max_bytes` is expected to fit into a single ScheduledData packet
    pub fn new(config: &HomaConfig, grant_max_bytes: u32, now: Instant) -> ReceiveScheduler {
        ReceiveScheduler {
            local_addr: config.local_addr,
            grant_max_bytes,
            max_message_bytes: config.max_message_bytes,
            num_senders_to_keep_granted: config.num_senders_to_keep_granted.safe_cast(),
            inbound: Default::default(),
            grant_queue: Default::default(),
            byte_bucket: ByteBucket::new(config.link_speed_bits_per_sec(), config.max_rtt, now),
            traffic_pacer: TrafficPacer::new(config),
        }
    }

    pub fn inbound_message(&self, key: &MessageKey) -> Option<&InboundMessage> {
        self.inbound.get(key)
    }

    pub fn num_inbound_messages(&self) -> usize {
        self.inbound.len()
    }

    pub fn traffic_pacer(&self) -> &TrafficPacer {
        &self.traffic_pacer
    }

    /// Handles a Request or UnscheduledData packet. The first such packet of a message sets up
    ///  its reassembly. Returns the message if it is complete.
    pub fn on_unsched_packet(&mut self, now: Instant, packet: &HomaPacket) -> anyhow::Result<Option<ReceivedMessage>> {
        let (msg_size, req_bytes, total_unsched_bytes, first_byte, data) = match &packet.kind {
            PacketKind::Request(p) => (p.msg_byte_len, p.data.len().prechecked_cast(), p.total_unsched_bytes, 0, &p.data),
            PacketKind::UnschedData(p) => (p.msg_byte_len, u32::from(p.req_bytes), p.total_unsched_bytes, p.first_byte, &p.data),
            _ => bail!("this is a bug: {:?} is not an unscheduled packet", packet),
        };

        let key = MessageKey { sender: packet.source, msg_id: packet.msg_id };
        if let Some(msg) = self.inbound.get(&key) {
            if msg.msg_size != msg_size || msg.total_unsched_bytes != total_unsched_bytes {
                bail!("{:?} does not match message {:?} of {} bytes with {} unscheduled bytes", packet, key, msg.msg_size, msg.total_unsched_bytes);
            }
        }
        else {
            if msg_size == 0 || req_bytes > total_unsched_bytes || total_unsched_bytes > msg_size {
                bail!("{:?} has inconsistent message sizes", packet);
            }
            if msg_size > self.max_message_bytes {
                bail!("{:?} exceeds the maximum message size of {} bytes", packet, self.max_message_bytes);
            }

            let msg = InboundMessage::new(key, msg_size, total_unsched_bytes, now);
            debug!("receiving message {:?} of {} bytes: {} unscheduled bytes, {} bytes to grant", key, msg_size, total_unsched_bytes, msg.bytes_to_grant);

            // announced at the first packet's priority, the pacer releases arrivals at other priorities
            self.traffic_pacer.unsched_pending_bytes(msg.rank(), req_bytes, PacketType::Request, packet.priority);
            self.traffic_pacer.unsched_pending_bytes(msg.rank(), total_unsched_bytes - req_bytes, PacketType::UnschedData, packet.priority);

            if msg.bytes_to_grant > 0 {
                self.grant_queue.insert(msg.rank());
            }
            self.inbound.insert(key, msg);
        }

        self.apply_data(key, packet, first_byte, data)
    }

    /// Handles a ScheduledData packet. Scheduled data for a message that is not being received,
    ///  beyond the bytes granted, or inside the message's unscheduled bytes is an error.
    pub fn on_sched_packet(&mut self, packet: &HomaPacket) -> anyhow::Result<Option<ReceivedMessage>> {
        let PacketKind::SchedData(p) = &packet.kind else {
            bail!("this is a bug: {:?} is not a scheduled packet", packet);
        };

        let key = MessageKey { sender: packet.source, msg_id: packet.msg_id };
        let Some(msg) = self.inbound.get_mut(&key) else {
            bail!("received {:?} for unknown message", packet);
        };
        let len: u32 = p.data.len().prechecked_cast();
        if p.first_byte < msg.total_unsched_bytes {
            bail!("{:?} overlaps the {} unscheduled bytes of its message", packet, msg.total_unsched_bytes);
        }
        if len > msg.bytes_granted_in_flight {
            bail!("{:?} exceeds the {} bytes granted for its message", packet, msg.bytes_granted_in_flight);
        }
        msg.bytes_granted_in_flight -= len;

        self.apply_data(key, packet, p.first_byte, &p.data)
    }

    fn apply_data(&mut self, key: MessageKey, packet: &HomaPacket, first_byte: u32, data: &Bytes) -> anyhow::Result<Option<ReceivedMessage>> {
        let Some(msg) = self.inbound.get_mut(&key) else {
            bail!("this is a bug: message {:?} was just looked up", key);
        };
        msg.apply_data(first_byte, data)?;
        trace!("{:?}: {} of {} bytes received", key, msg.bytes_received(), msg.msg_size);

        self.traffic_pacer.bytes_arrived(&key, data.len().prechecked_cast(), packet.pkt_type(), packet.priority);

        if msg.bytes_to_receive > 0 {
            return Ok(None);
        }

        let Some(msg) = self.remove(&key) else {
            bail!("this is a bug: message {:?} was just looked up", key);
        };
        debug!("message {:?} of {} bytes received completely", key, msg.msg_size);
        Ok(Some(ReceivedMessage {
            sender: key.sender,
            msg_id: key.msg_id,
            data: msg.data.freeze(),
        }))
    }

    /// Drops a message that is being received. Returns `false` if there was no such message.
    pub fn abandon(&mut self, key: &MessageKey) -> bool {
        let abandoned = self.remove(key).is_some();
        if abandoned {
            debug!("abandoned inbound message {:?}", key);
        }
        abandoned
    }

    fn remove(&mut self, key: &MessageKey) -> Option<InboundMessage> {
        let msg = self.inbound.remove(key)?;
        self.grant_queue.remove(&msg.rank());
        self.traffic_pacer.forget(key);
        Some(msg)
    }

    /// The messages eligible for a grant: the shortest remaining message of each of the senders
    ///  with the shortest remaining messages
    fn grant_candidates(&self) -> Vec<MessageRank> {
        let mut senders = Vec::with_capacity(self.num_senders_to_keep_granted);
        let mut candidates = Vec::with_capacity(self.num_senders_to_keep_granted);
        for rank in &self.grant_queue {
            if senders.len() == self.num_senders_to_keep_granted {
                break;
            }
            if senders.contains(&rank.key.sender) {
                continue;
            }
            senders.push(rank.key.sender);
            candidates.push(*rank);
        }
        candidates
    }

    /// Issues grants as long as budget and pacing allow.
    pub fn send_and_schedule_grant(&mut self, now: Instant, prio_resolver: &PriorityResolver) -> anyhow::Result<GrantRound> {
        let mut grants = Vec::new();

        'rounds: loop {
            let candidates = self.grant_candidates();
            if candidates.is_empty() {
                break;
            }

            for rank in candidates {
                let grant_size = rank.bytes_to_grant.min(self.grant_max_bytes);
                let size_on_wire = bytes_on_wire(grant_size, PacketType::SchedData);
                if self.byte_bucket.available(now)? < size_on_wire {
                    let next_grant_time = self.byte_bucket.next_available_time(now, size_on_wire)?;
                    trace!("byte bucket exhausted, next grant at {:?}", next_grant_time);
                    return Ok(GrantRound { grants, next_grant_time: Some(next_grant_time) });
                }

                match self.traffic_pacer.get_grant(now, rank, grant_size, prio_resolver) {
                    GrantDecision::Grant { prio, size_on_wire } => {
                        self.byte_bucket.grant(size_on_wire, now)?;
                        grants.push(self.grant(now, rank, grant_size, prio));
                        continue 'rounds;
                    }
                    GrantDecision::RateLimited { until } => {
                        return Ok(GrantRound { grants, next_grant_time: Some(until) });
                    }
                    GrantDecision::OverBudget => {}
                }
            }
            break;
        }

        Ok(GrantRound { grants, next_grant_time: None })
    }

    fn grant(&mut self, now: Instant, rank: MessageRank, grant_size: u32, sched_prio: u8) -> HomaPacket {
        self.grant_queue.remove(&rank);
        if let Some(msg) = self.inbound.get_mut(&rank.key) {
            msg.bytes_to_grant -= grant_size;
            msg.bytes_granted_in_flight += grant_size;
            msg.last_grant_at = Some(now);
            if msg.bytes_to_grant > 0 {
                self.grant_queue.insert(msg.rank());
            }
        }

        trace!("granting {} bytes of {:?} at priority {}", grant_size, rank.key, sched_prio);
        HomaPacket {
            source: self.local_addr,
            destination: rank.key.sender,
            msg_id: rank.key.msg_id,
            priority: GRANT_PRIO,
            kind: PacketKind::Grant(GrantPacket {
                grant_bytes: grant_size.prechecked_cast(),
                sched_prio,
            }),
        }
    }
}
