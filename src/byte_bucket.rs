use std::time::Duration;

use anyhow::bail;
use tokio::time::Instant;
use tracing::trace;

use crate::safe_converter::PrecheckedCast;

/// The balance is kept in units of 'bytes * 8e9', i.e. bits per nanosecond of link time, so that
///  refilling at link speed for an arbitrary number of nanoseconds is exact
const UNITS_PER_BYTE: u128 = 8 * 1_000_000_000;

/// A token bucket that bounds the rate of bytes granted by a receiver to its link speed. It allows
///  bursts of up to one maximum round trip's worth of bytes.
pub struct ByteBucket {
    link_speed_bps: u64,
    bucket_max_units: u128,
    balance_units: u128,
    last_refill: Instant,
}

impl ByteBucket {
    /// The bucket starts out full
    pub fn new(link_speed_bps: u64, max_rtt: Duration, now: Instant) -> ByteBucket {
        let bucket_max_units = link_speed_bps as u128 * max_rtt.as_nanos();
        ByteBucket {
            link_speed_bps,
            bucket_max_units,
            balance_units: bucket_max_units,
            last_refill: now,
        }
    }

    pub fn bucket_max(&self) -> u64 {
        (self.bucket_max_units / UNITS_PER_BYTE).prechecked_cast()
    }

    fn refill(&mut self, now: Instant) -> anyhow::Result<()> {
        if now < self.last_refill {
            bail!("this is a bug: time moved backwards in byte bucket ({:?} before {:?})", now, self.last_refill);
        }

        let elapsed_nanos = now.duration_since(self.last_refill).as_nanos();
        self.balance_units = self.balance_units
            .saturating_add(elapsed_nanos.saturating_mul(self.link_speed_bps as u128))
            .min(self.bucket_max_units);
        self.last_refill = now;
        Ok(())
    }

    /// The number of whole bytes available at `now`
    pub fn available(&mut self, now: Instant) -> anyhow::Result<u32> {
        self.refill(now)?;
        Ok(self.balance_bytes())
    }

    /// Takes up to `requested_bytes` from the bucket, returning the number of bytes actually
    ///  granted. That is less than requested if the balance is insufficient.
    pub fn grant(&mut self, requested_bytes: u32, now: Instant) -> anyhow::Result<u32> {
        self.refill(now)?;

        let granted = requested_bytes.min(self.balance_bytes());
        self.balance_units -= granted as u128 * UNITS_PER_BYTE;
        trace!("granted {} of {} requested bytes, {} bytes left", granted, requested_bytes, self.balance_bytes());
        Ok(granted)
    }

    /// The point in time at which the next grant can be issued after a grant of
    ///  `granted_size_on_wire` bytes at `now`, based on its serialization delay at link speed
    pub fn get_grant_time(&self, now: Instant, granted_size_on_wire: u32) -> Instant {
        now + serialization_delay(granted_size_on_wire, self.link_speed_bps)
    }

    /// The earliest point in time at which the bucket holds at least `bytes` bytes, assuming there
    ///  are no grants in between
    pub fn next_available_time(&mut self, now: Instant, bytes: u32) -> anyhow::Result<Instant> {
        self.refill(now)?;
        let required_units = bytes as u128 * UNITS_PER_BYTE;
        if required_units <= self.balance_units {
            return Ok(now);
        }
        let missing_units = required_units - self.balance_units;
        let nanos = missing_units.div_ceil(self.link_speed_bps as u128);
        Ok(now + Duration::from_nanos(nanos.try_into().unwrap_or(u64::MAX)))
    }

    fn balance_bytes(&self) -> u32 {
        (self.balance_units / UNITS_PER_BYTE).try_into().unwrap_or(u32::MAX)
    }
}

/// the time it takes to put `bytes_on_wire` bytes on a link with the given speed, rounded up to
///  whole nanoseconds
pub fn serialization_delay(bytes_on_wire: u32, link_speed_bps: u64) -> Duration {
    let bits = bytes_on_wire as u128 * UNITS_PER_BYTE;
    let nanos = bits.div_ceil(link_speed_bps as u128);
    Duration::from_nanos(nanos.try_into().unwrap_or(u64::MAX))
}
