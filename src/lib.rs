//! This crate implements the core of Homa, a receiver-driven transport protocol for low latency
//!  messaging inside data centers.
//!
//! ## Protocol overview
//!
//! * The abstraction is sending / receiving *messages*, i.e. defined-length chunks of data
//! * A sender transmits the first bytes of a message without permission: a Request packet,
//!    followed by UnscheduledData packets up to a configured number of bytes
//! * The remaining bytes are *scheduled*: the receiver sends Grant packets, and the sender
//!    responds to each grant with a single ScheduledData packet
//! * The receiver grants in shortest-remaining-processing-time (SRPT) order, limits the bytes in
//!    flight towards itself, and paces grants to its link speed
//! * Packets carry a network priority (0 being the highest). Unscheduled packets use the higher
//!    priorities and are assigned by message size, based on the size distribution of the
//!    workload. Scheduled packets use the lower priorities and are assigned by the receiver.
//!
//! Loss is not handled: a lost packet stalls its message until it is abandoned.
//!
//! ## Wire format
//!
//! All numbers are in network byte order (BE). Addresses are not part of the Homa header, they
//!  come from the surrounding datagram.
//!
//! ```ascii
//! common header:
//!  0: packet type (u8): 1 Request, 2 UnscheduledData, 3 ScheduledData, 4 Grant
//!  1: priority (u8)
//!  2: message id (u64)
//!
//! Request:
//! 10: message length (u32)
//! 14: request bytes (u16)
//! 16: total unscheduled bytes (u32)
//! 20: unscheduled priority (u8)
//! 21: payload
//!
//! UnscheduledData:
//! 10: message length (u32)
//! 14: request bytes (u16)
//! 16: total unscheduled bytes (u32)
//! 20: first byte (u32)
//! 24: last byte (u32), inclusive
//! 28: payload
//!
//! ScheduledData:
//! 10: first byte (u32)
//! 14: last byte (u32), inclusive
//! 18: payload
//!
//! Grant:
//! 10: granted bytes (u16)
//! 12: scheduled priority (u8)
//! ```

pub mod byte_bucket;
pub mod config;
pub mod endpoint;
pub mod message_key;
pub mod packet;
pub mod priority_resolver;
pub mod receive_scheduler;
pub mod safe_converter;
pub mod send_controller;
pub mod traffic_pacer;
pub mod transport;
pub mod unsched_byte_allocator;
pub mod workload_estimator;

#[cfg(test)] mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
