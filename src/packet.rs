use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const MAX_ETHERNET_PAYLOAD_BYTES: u32 = 1500;
pub const MIN_ETHERNET_PAYLOAD_BYTES: u32 = 46;
pub const ETHERNET_HDR_SIZE: u32 = 14;
pub const ETHERNET_CRC_SIZE: u32 = 4;
pub const ETHERNET_PREAMBLE_SIZE: u32 = 8;
pub const INTER_PKT_GAP: u32 = 12;
pub const IP_HEADER_SIZE: u32 = 20;
pub const UDP_HEADER_SIZE: u32 = 8;

/// link layer overhead of every frame in addition to its Ethernet payload
const FRAME_OVERHEAD: u32 = ETHERNET_HDR_SIZE + ETHERNET_CRC_SIZE + ETHERNET_PREAMBLE_SIZE + INTER_PKT_GAP;

/// packet type (u8), priority (u8), message id (u64)
const COMMON_HEADER_SIZE: u32 = 1 + 1 + 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 1,
    UnschedData = 2,
    SchedData = 3,
    Grant = 4,
}
impl PacketType {
    /// Size of the Homa header for this packet type, i.e. everything inside the UDP payload
    ///  except the data bytes
    pub fn header_size(self) -> u32 {
        COMMON_HEADER_SIZE + match self {
            PacketType::Request => 4 + 2 + 4 + 1,
            PacketType::UnschedData => 4 + 2 + 4 + 4 + 4,
            PacketType::SchedData => 4 + 4,
            PacketType::Grant => 2 + 1,
        }
    }

    /// The maximum number of data bytes a single packet of this type can carry without
    ///  exceeding a full Ethernet frame
    pub fn max_data_bytes(self) -> u32 {
        match self {
            PacketType::Grant => 0,
            _ => MAX_ETHERNET_PAYLOAD_BYTES - IP_HEADER_SIZE - UDP_HEADER_SIZE - self.header_size(),
        }
    }
}

/// Calculates the number of bytes that `data_bytes` of payload occupy on the wire when sent as
///  packets of type `pkt_type`: Packets are filled up to full Ethernet frames, and each frame is
///  charged with headers, padding up to the minimum frame size, and link layer framing (preamble,
///  CRC and inter-packet gap).
pub fn bytes_on_wire(data_bytes: u32, pkt_type: PacketType) -> u32 {
    let header_size = pkt_type.header_size();
    let max_data_in_pkt = MAX_ETHERNET_PAYLOAD_BYTES - IP_HEADER_SIZE - UDP_HEADER_SIZE - header_size;

    let num_full_pkts = data_bytes / max_data_in_pkt;
    let mut bytes_on_wire = num_full_pkts * (MAX_ETHERNET_PAYLOAD_BYTES + FRAME_OVERHEAD);

    let mut partial_bytes = data_bytes - num_full_pkts * max_data_in_pkt;
    if num_full_pkts > 0 && partial_bytes == 0 {
        return bytes_on_wire;
    }

    partial_bytes += header_size + IP_HEADER_SIZE + UDP_HEADER_SIZE;
    if partial_bytes < MIN_ETHERNET_PAYLOAD_BYTES {
        partial_bytes = MIN_ETHERNET_PAYLOAD_BYTES;
    }
    bytes_on_wire += partial_bytes + FRAME_OVERHEAD;
    bytes_on_wire
}

/// The first packet of every message. It carries the message's metadata and the first
///  `data.len()` bytes of the message.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RequestPacket {
    pub msg_byte_len: u32,
    pub total_unsched_bytes: u32,
    /// the priority the sender uses for this message's unscheduled data
    pub unsched_prio: u8,
    pub data: Bytes,
}

/// Unscheduled data follows the Request without waiting for a grant. It repeats the message's
///  metadata so that the receiver can set up reassembly even if the Request is delayed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UnschedDataPacket {
    pub msg_byte_len: u32,
    pub req_bytes: u16,
    pub total_unsched_bytes: u32,
    pub first_byte: u32,
    pub data: Bytes,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SchedDataPacket {
    pub first_byte: u32,
    pub data: Bytes,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct GrantPacket {
    pub grant_bytes: u16,
    /// the priority at which the sender transmits the granted bytes
    pub sched_prio: u8,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PacketKind {
    Request(RequestPacket),
    UnschedData(UnschedDataPacket),
    SchedData(SchedDataPacket),
    Grant(GrantPacket),
}

/// A single Homa packet. Source and destination are not part of the serialized header, they
///  are taken from the datagram's envelope.
#[derive(Clone, Eq, PartialEq)]
pub struct HomaPacket {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub msg_id: u64,
    pub priority: u8,
    pub kind: PacketKind,
}

impl Debug for HomaPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PacketKind::Request(p) => write!(f, "REQ{{{}#{} P{} {}/{} unsched:{}}}", self.source, self.msg_id, self.priority, p.data.len(), p.msg_byte_len, p.total_unsched_bytes),
            PacketKind::UnschedData(p) => write!(f, "UNSCHED{{{}#{} P{} [{}+{}]/{}}}", self.source, self.msg_id, self.priority, p.first_byte, p.data.len(), p.msg_byte_len),
            PacketKind::SchedData(p) => write!(f, "SCHED{{{}#{} P{} [{}+{}]}}", self.source, self.msg_id, self.priority, p.first_byte, p.data.len()),
            PacketKind::Grant(p) => write!(f, "GRANT{{{}#{} P{} {}@P{}}}", self.source, self.msg_id, self.priority, p.grant_bytes, p.sched_prio),
        }
    }
}

impl HomaPacket {
    pub fn pkt_type(&self) -> PacketType {
        match &self.kind {
            PacketKind::Request(_) => PacketType::Request,
            PacketKind::UnschedData(_) => PacketType::UnschedData,
            PacketKind::SchedData(_) => PacketType::SchedData,
            PacketKind::Grant(_) => PacketType::Grant,
        }
    }

    pub fn data_bytes(&self) -> u32 {
        match &self.kind {
            PacketKind::Request(p) => p.data.len().prechecked_cast(),
            PacketKind::UnschedData(p) => p.data.len().prechecked_cast(),
            PacketKind::SchedData(p) => p.data.len().prechecked_cast(),
            PacketKind::Grant(_) => 0,
        }
    }

    /// the message length, for packet types that carry it
    pub fn msg_byte_len(&self) -> Option<u32> {
        match &self.kind {
            PacketKind::Request(p) => Some(p.msg_byte_len),
            PacketKind::UnschedData(p) => Some(p.msg_byte_len),
            PacketKind::SchedData(_) | PacketKind::Grant(_) => None,
        }
    }

    /// the number of bytes this packet occupies on the wire
    pub fn bytes_on_wire(&self) -> u32 {
        bytes_on_wire(self.data_bytes(), self.pkt_type())
    }

    pub fn serialized_len(&self) -> usize {
        (self.pkt_type().header_size() + self.data_bytes()).safe_cast()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.pkt_type().into());
        buf.put_u8(self.priority);
        buf.put_u64(self.msg_id);

        match &self.kind {
            PacketKind::Request(p) => {
                buf.put_u32(p.msg_byte_len);
                buf.put_u16(p.data.len().prechecked_cast());
                buf.put_u32(p.total_unsched_bytes);
                buf.put_u8(p.unsched_prio);
                buf.put_slice(&p.data);
            }
            PacketKind::UnschedData(p) => {
                buf.put_u32(p.msg_byte_len);
                buf.put_u16(p.req_bytes);
                buf.put_u32(p.total_unsched_bytes);
                buf.put_u32(p.first_byte);
                buf.put_u32(last_byte(p.first_byte, &p.data));
                buf.put_slice(&p.data);
            }
            PacketKind::SchedData(p) => {
                buf.put_u32(p.first_byte);
                buf.put_u32(last_byte(p.first_byte, &p.data));
                buf.put_slice(&p.data);
            }
            PacketKind::Grant(p) => {
                buf.put_u16(p.grant_bytes);
                buf.put_u8(p.sched_prio);
            }
        }
    }

    /// Parses a complete datagram. Trailing bytes after the packet are an error.
    pub fn deser(buf: &mut impl Buf, source: SocketAddr, destination: SocketAddr) -> anyhow::Result<HomaPacket> {
        let raw_type = buf.try_get_u8()?;
        let pkt_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("unsupported packet type {}", raw_type))?;
        let priority = buf.try_get_u8()?;
        let msg_id = buf.try_get_u64()?;

        let kind = match pkt_type {
            PacketType::Request => {
                let msg_byte_len = buf.try_get_u32()?;
                let req_bytes = buf.try_get_u16()?;
                let total_unsched_bytes = buf.try_get_u32()?;
                let unsched_prio = buf.try_get_u8()?;
                if u32::from(req_bytes) > total_unsched_bytes || total_unsched_bytes > msg_byte_len {
                    bail!("inconsistent request header: {} request bytes, {} unscheduled bytes, message length {}", req_bytes, total_unsched_bytes, msg_byte_len);
                }
                let data = take_data(buf, req_bytes.safe_cast())?;
                PacketKind::Request(RequestPacket { msg_byte_len, total_unsched_bytes, unsched_prio, data })
            }
            PacketType::UnschedData => {
                let msg_byte_len = buf.try_get_u32()?;
                let req_bytes = buf.try_get_u16()?;
                let total_unsched_bytes = buf.try_get_u32()?;
                let (first_byte, data) = deser_range(buf)?;
                if u32::from(req_bytes) > total_unsched_bytes || total_unsched_bytes > msg_byte_len {
                    bail!("inconsistent unscheduled data header: {} request bytes, {} unscheduled bytes, message length {}", req_bytes, total_unsched_bytes, msg_byte_len);
                }
                if first_byte as u64 + data.len() as u64 > total_unsched_bytes as u64 {
                    bail!("unscheduled data [{}+{}] exceeds the unscheduled bytes {}", first_byte, data.len(), total_unsched_bytes);
                }
                PacketKind::UnschedData(UnschedDataPacket { msg_byte_len, req_bytes, total_unsched_bytes, first_byte, data })
            }
            PacketType::SchedData => {
                let (first_byte, data) = deser_range(buf)?;
                PacketKind::SchedData(SchedDataPacket { first_byte, data })
            }
            PacketType::Grant => {
                let grant_bytes = buf.try_get_u16()?;
                let sched_prio = buf.try_get_u8()?;
                PacketKind::Grant(GrantPacket { grant_bytes, sched_prio })
            }
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?} packet", buf.remaining(), pkt_type);
        }

        Ok(HomaPacket {
            source,
            destination,
            msg_id,
            priority,
            kind,
        })
    }
}

fn last_byte(first_byte: u32, data: &Bytes) -> u32 {
    let len: u32 = data.len().prechecked_cast();
    first_byte + len - 1
}

fn deser_range(buf: &mut impl Buf) -> anyhow::Result<(u32, Bytes)> {
    let first_byte = buf.try_get_u32()?;
    let last_byte = buf.try_get_u32()?;
    if last_byte < first_byte {
        bail!("invalid byte range {}..={}", first_byte, last_byte);
    }
    let data = take_data(buf, last_byte - first_byte + 1)?;
    Ok((first_byte, data))
}

fn take_data(buf: &mut impl Buf, len: u32) -> anyhow::Result<Bytes> {
    let len: usize = len.safe_cast();
    if buf.remaining() < len {
        bail!("packet truncated: expected {} data bytes, {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}
