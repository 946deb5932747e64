use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::packet::{HomaPacket, PacketType};

/// Decides how many bytes of a new message go into its Request packet, and how many bytes the
///  sender transmits unscheduled after that.
///
/// The numbers are kept per destination as tables mapping size thresholds to byte counts: the
///  entry for the smallest threshold that is at least the message size applies. Tables are
///  created lazily with a single entry for the configured default.
pub struct UnschedByteAllocator {
    default_req_bytes: u32,
    default_unsched_bytes: u32,
    req_bytes_by_dest: FxHashMap<SocketAddr, BTreeMap<u32, u32>>,
    unsched_bytes_by_dest: FxHashMap<SocketAddr, BTreeMap<u32, u32>>,
}

impl UnschedByteAllocator {
    pub fn new(default_req_bytes: u32, default_unsched_bytes: u32) -> anyhow::Result<UnschedByteAllocator> {
        if default_req_bytes > PacketType::Request.max_data_bytes() {
            bail!("default request bytes {} do not fit into a single request packet ({} bytes)", default_req_bytes, PacketType::Request.max_data_bytes());
        }

        Ok(UnschedByteAllocator {
            default_req_bytes,
            default_unsched_bytes,
            req_bytes_by_dest: Default::default(),
            unsched_bytes_by_dest: Default::default(),
        })
    }

    /// The number of data bytes in the Request packet of a message of size `msg_size` to `dest`
    pub fn req_bytes(&mut self, dest: SocketAddr, msg_size: u32) -> u32 {
        let default = self.default_req_bytes;
        let table = self.req_bytes_by_dest
            .entry(dest)
            .or_insert_with(|| BTreeMap::from([(u32::MAX, default)]));

        lookup(table, msg_size, default).min(msg_size)
    }

    /// The number of bytes sent without grant after the Request packet
    pub fn unsched_bytes(&mut self, dest: SocketAddr, msg_size: u32) -> u32 {
        let req_bytes = self.req_bytes(dest, msg_size);
        if msg_size <= req_bytes {
            return 0;
        }

        let default = self.default_unsched_bytes;
        let table = self.unsched_bytes_by_dest
            .entry(dest)
            .or_insert_with(|| BTreeMap::from([(u32::MAX, default)]));

        lookup(table, msg_size, default).min(msg_size - req_bytes)
    }

    /// The data bytes of each unscheduled packet for a message: the Request packet first,
    ///  followed by UnscheduledData packets, each filled up to its maximum payload
    pub fn req_unsched_data_pkts(&mut self, dest: SocketAddr, msg_size: u32) -> Vec<u32> {
        let req_bytes = self.req_bytes(dest, msg_size);
        let mut unsched_bytes = self.unsched_bytes(dest, msg_size);

        let max_pkt_bytes = PacketType::UnschedData.max_data_bytes();
        let mut result = Vec::with_capacity(1 + unsched_bytes.div_ceil(max_pkt_bytes) as usize);
        result.push(req_bytes);
        while unsched_bytes > 0 {
            let pkt_bytes = unsched_bytes.min(max_pkt_bytes);
            result.push(pkt_bytes);
            unsched_bytes -= pkt_bytes;
        }
        result
    }

    /// Hook for adapting request sizes based on grants. Tables are static for now, so
    ///  this does nothing.
    pub fn update_req_data_bytes(&mut self, _grant: &HomaPacket) {
    }

    /// Hook for adapting unscheduled bytes based on grants, see [Self::update_req_data_bytes]
    pub fn update_unsched_bytes(&mut self, _grant: &HomaPacket) {
    }
}

fn lookup(table: &BTreeMap<u32, u32>, msg_size: u32, default: u32) -> u32 {
    table.range(msg_size..)
        .next()
        .map(|(_, &bytes)| bytes)
        .unwrap_or(default)
}
