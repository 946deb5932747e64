use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

use crate::config::HomaConfig;
use crate::message_key::MessageKey;
use crate::packet::{HomaPacket, PacketKind, PacketType};
use crate::priority_resolver::PriorityResolver;
use crate::receive_scheduler::{ReceiveScheduler, ReceivedMessage};
use crate::send_controller::SendController;
use crate::unsched_byte_allocator::UnschedByteAllocator;
use crate::workload_estimator::WorkloadEstimator;

/// This is an abstraction for handing packets to the network, introduced to keep the protocol
///  logic free of I/O
#[cfg_attr(test, automock)]
pub trait PacketSender: Send + Sync + 'static {
    fn send_packet(&self, packet: HomaPacket);
}

/// The receiver's grant timer. There is at most one pending deadline: scheduling a new deadline
///  replaces the previous one.
#[cfg_attr(test, automock)]
pub trait GrantTimer: Send + Sync + 'static {
    fn schedule_at(&self, at: Instant);
    fn cancel(&self);
}

/// HomaTransport is where sender and receiver side come together: It dispatches arriving packets
///  by type, and it drives grant rounds in response to arriving data and to the grant timer.
///
/// All operations are synchronous and expect non-decreasing timestamps.
pub struct HomaTransport {
    local_addr: SocketAddr,
    max_message_bytes: u32,
    send_controller: SendController,
    receive_scheduler: ReceiveScheduler,
    workload: WorkloadEstimator,
    prio_resolver: PriorityResolver,
    packet_sender: Arc<dyn PacketSender>,
    grant_timer: Arc<dyn GrantTimer>,
}

impl HomaTransport {
    pub fn new(config: &HomaConfig, packet_sender: Arc<dyn PacketSender>, grant_timer: Arc<dyn GrantTimer>, now: Instant) -> anyhow::Result<HomaTransport> {
        Self::with_first_msg_id(config, packet_sender, grant_timer, now, rand::random())
    }

    /// Message ids of this transport start at `first_msg_id` rather than at a random value
    pub fn with_first_msg_id(config: &HomaConfig, packet_sender: Arc<dyn PacketSender>, grant_timer: Arc<dyn GrantTimer>, now: Instant, first_msg_id: u64) -> anyhow::Result<HomaTransport> {
        config.validate()?;

        let max_sched_bytes = PacketType::SchedData.max_data_bytes();
        let grant_max_bytes = if config.grant_max_bytes > max_sched_bytes {
            info!("reducing grant max bytes from {} to the payload of a single scheduled packet ({})", config.grant_max_bytes, max_sched_bytes);
            max_sched_bytes
        }
        else {
            config.grant_max_bytes
        };

        let workload = WorkloadEstimator::from_source(&config.workload, config.cbf_cap_msg_size)?;
        let prio_resolver = PriorityResolver::new(config, &workload);
        let unsched_byte_allocator = UnschedByteAllocator::new(config.default_req_bytes, config.default_unsched_bytes)?;

        debug!("starting Homa transport on {:?}: {:?} pacing, {:?} priority resolution", config.local_addr, config.pacing_mode, config.prio_resolution_mode);
        Ok(HomaTransport {
            local_addr: config.local_addr,
            max_message_bytes: config.max_message_bytes,
            send_controller: SendController::new(config.local_addr, unsched_byte_allocator, first_msg_id),
            receive_scheduler: ReceiveScheduler::new(config, grant_max_bytes, now),
            workload,
            prio_resolver,
            packet_sender,
            grant_timer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_controller(&self) -> &SendController {
        &self.send_controller
    }

    pub fn receive_scheduler(&self) -> &ReceiveScheduler {
        &self.receive_scheduler
    }

    /// Sends a message, returning its id. The unscheduled part is sent right away.
    pub fn send_message(&mut self, now: Instant, destination: SocketAddr, data: Bytes) -> anyhow::Result<u64> {
        let msg_size = data.len();
        if msg_size > self.max_message_bytes as usize {
            bail!("message of {} bytes exceeds the maximum message size of {} bytes", msg_size, self.max_message_bytes);
        }
        let (msg_id, packets) = self.send_controller.send_message(now, destination, data, &self.prio_resolver)?;
        self.record_message_size(msg_size as u32);

        for packet in packets {
            self.packet_sender.send_packet(packet);
        }
        Ok(msg_id)
    }

    /// Entry point for every arriving packet. Returns the completely received message if this
    ///  packet was its last missing piece.
    ///
    /// An error means that the peer violated the protocol in a way that this transport can not
    ///  recover from.
    #[instrument(skip_all)]
    pub fn on_packet_received(&mut self, now: Instant, packet: HomaPacket) -> anyhow::Result<Option<ReceivedMessage>> {
        trace!("received {:?}", packet);

        let received = match &packet.kind {
            PacketKind::Request(_) | PacketKind::UnschedData(_) => {
                let key = MessageKey { sender: packet.source, msg_id: packet.msg_id };
                let is_new = self.receive_scheduler.inbound_message(&key).is_none();

                let received = self.receive_scheduler.on_unsched_packet(now, &packet)?;
                if is_new {
                    if let Some(msg_size) = packet.msg_byte_len() {
                        self.record_message_size(msg_size);
                    }
                }
                received
            }
            PacketKind::SchedData(_) => self.receive_scheduler.on_sched_packet(&packet)?,
            PacketKind::Grant(_) => {
                let sched_packet = self.send_controller.process_received_grant(&packet)?;
                self.packet_sender.send_packet(sched_packet);
                return Ok(None);
            }
        };

        self.send_and_schedule_grant(now)?;
        Ok(received)
    }

    /// Called when the grant timer fires
    pub fn on_grant_timer(&mut self, now: Instant) -> anyhow::Result<()> {
        self.send_and_schedule_grant(now)
    }

    fn send_and_schedule_grant(&mut self, now: Instant) -> anyhow::Result<()> {
        let round = self.receive_scheduler.send_and_schedule_grant(now, &self.prio_resolver)?;
        for grant in round.grants {
            self.packet_sender.send_packet(grant);
        }

        match round.next_grant_time {
            Some(at) => self.grant_timer.schedule_at(at),
            None => self.grant_timer.cancel(),
        }
        Ok(())
    }

    /// Stops sending a message. Returns `false` if there was no such message.
    pub fn abandon_outbound(&mut self, msg_id: u64) -> bool {
        self.send_controller.abandon(msg_id)
    }

    /// Drops a partially received message. Returns `false` if there was no such message.
    pub fn abandon_inbound(&mut self, sender: SocketAddr, msg_id: u64) -> bool {
        self.receive_scheduler.abandon(&MessageKey { sender, msg_id })
    }

    fn record_message_size(&mut self, msg_size: u32) {
        if self.workload.record_message_size(msg_size) {
            self.prio_resolver.refresh(&self.workload);
        }
    }
}
