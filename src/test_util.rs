use std::sync::Mutex;

use tokio::time::Instant;

use crate::packet::HomaPacket;
use crate::transport::{GrantTimer, PacketSender};

/// Collects sent packets for later inspection
#[derive(Default)]
pub struct RecordingPacketSender {
    packets: Mutex<Vec<HomaPacket>>,
}
impl RecordingPacketSender {
    pub fn take(&self) -> Vec<HomaPacket> {
        std::mem::take(&mut *self.packets.lock().unwrap())
    }
}
impl PacketSender for RecordingPacketSender {
    fn send_packet(&self, packet: HomaPacket) {
        self.packets.lock().unwrap().push(packet);
    }
}

/// Holds the most recently scheduled grant deadline
#[derive(Default)]
pub struct RecordingGrantTimer {
    deadline: Mutex<Option<Instant>>,
}
impl RecordingGrantTimer {
    pub fn take_deadline(&self) -> Option<Instant> {
        self.deadline.lock().unwrap().take()
    }
}
impl GrantTimer for RecordingGrantTimer {
    fn schedule_at(&self, at: Instant) {
        *self.deadline.lock().unwrap() = Some(at);
    }

    fn cancel(&self) {
        *self.deadline.lock().unwrap() = None;
    }
}
