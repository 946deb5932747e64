use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::byte_bucket::serialization_delay;
use crate::config::{HomaConfig, PacingMode, PrioResolutionMode};
use crate::message_key::{MessageKey, MessageRank};
use crate::packet::{bytes_on_wire, PacketType};
use crate::priority_resolver::PriorityResolver;
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GrantDecision {
    Grant { prio: u8, size_on_wire: u32 },
    /// the previous grant is still being serialized, no grant before `until`
    RateLimited { until: Instant },
    /// granting would exceed the budget of bytes in flight
    OverBudget,
}

/// The receiver side's decision whether a grant can be issued right now, and at which priority.
///
/// The pacer keeps track of the bytes in flight towards this receiver: unscheduled bytes that
///  senders announced, and bytes that were granted and did not arrive yet. Both are kept per
///  priority and per message, and a grant is issued only if it does not exceed the configured
///  budget of bytes in flight.
///
/// Per-priority maps are keyed by [MessageRank], i.e. in SRPT order. A message's rank changes only
///  when it is granted, and the pacer re-keys the message's entries at that point.
pub struct TrafficPacer {
    mode: PacingMode,
    link_speed_bps: u64,
    max_in_flight_bytes: u64,
    sched_prio_base: u16,

    next_grant_time: Option<Instant>,
    total_outstanding_bytes: u64,
    unsched_in_flight_bytes: u64,
    /// indexed by scheduled priority level, i.e. priority minus `sched_prio_base`
    sched_in_flight: Vec<BTreeMap<MessageRank, u64>>,
    /// indexed by priority
    unsched_in_flight: Vec<BTreeMap<MessageRank, u64>>,
    ranks: FxHashMap<MessageKey, MessageRank>,
}

impl TrafficPacer {
    pub fn new(config: &HomaConfig) -> TrafficPacer {
        TrafficPacer {
            mode: config.pacing_mode,
            link_speed_bps: config.link_speed_bits_per_sec(),
            max_in_flight_bytes: config.max_outstanding_recv_bytes.safe_cast(),
            sched_prio_base: config.sched_priority_base(),
            next_grant_time: None,
            total_outstanding_bytes: 0,
            unsched_in_flight_bytes: 0,
            sched_in_flight: vec![BTreeMap::new(); config.sched_priority_levels.safe_cast()],
            unsched_in_flight: vec![BTreeMap::new(); config.total_priority_levels.safe_cast()],
            ranks: Default::default(),
        }
    }

    pub fn total_outstanding_bytes(&self) -> u64 {
        self.total_outstanding_bytes
    }

    pub fn unsched_in_flight_bytes(&self) -> u64 {
        self.unsched_in_flight_bytes
    }

    /// granted bytes in flight at a given priority
    pub fn sched_in_flight_at(&self, prio: u8) -> u64 {
        self.sched_level(prio)
            .map(|level| self.sched_in_flight[level].values().sum())
            .unwrap_or(0)
    }

    fn sched_level(&self, prio: u8) -> Option<usize> {
        let level = (prio as u16).checked_sub(self.sched_prio_base)?;
        let level: usize = level.safe_cast();
        (level < self.sched_in_flight.len()).then_some(level)
    }

    fn sched_prio(&self, level: usize) -> u8 {
        let level: u16 = level.prechecked_cast();
        (self.sched_prio_base + level).prechecked_cast()
    }

    fn current_rank(&self, key: &MessageKey) -> Option<MessageRank> {
        self.ranks.get(key).copied()
    }

    /// Decides if `grant_size` bytes can be granted to the message ranked `rank` at `now`. The
    ///  rank reflects the message's state before the grant. On success, the grant is accounted for
    ///  as being in flight.
    pub fn get_grant(&mut self, now: Instant, rank: MessageRank, grant_size: u32, resolver: &PriorityResolver) -> GrantDecision {
        if let Some(next_grant_time) = self.next_grant_time {
            if next_grant_time > now {
                return GrantDecision::RateLimited { until: next_grant_time };
            }
        }

        let size_on_wire = bytes_on_wire(grant_size, PacketType::SchedData);
        let level = match self.mode {
            PacingMode::NoOverCommit => self.fits_total_budget(size_on_wire)
                .then(|| self.sched_in_flight.len() - 1),
            PacingMode::PrioFromCbf => {
                if self.fits_total_budget(size_on_wire) {
                    let prio = resolver.get_prio_for_pkt(&PrioResolutionMode::StaticFromCbf, rank.bytes_to_grant, PacketType::SchedData);
                    self.sched_level(prio)
                }
                else {
                    None
                }
            }
            PacingMode::LowestPrioPossible => self.lowest_possible_level(rank, size_on_wire),
        };

        let Some(level) = level else {
            trace!("grant of {} bytes for {:?} exceeds the budget: {} bytes outstanding", grant_size, rank.key, self.total_outstanding_bytes);
            return GrantDecision::OverBudget;
        };

        self.commit_grant(rank, grant_size, size_on_wire, level);
        self.next_grant_time = Some(now + serialization_delay(size_on_wire, self.link_speed_bps));

        let prio = self.sched_prio(level);
        trace!("granting {} bytes for {:?} at priority {}", grant_size, rank.key, prio);
        GrantDecision::Grant { prio, size_on_wire }
    }

    fn fits_total_budget(&self, size_on_wire: u32) -> bool {
        self.total_outstanding_bytes + size_on_wire as u64 <= self.max_in_flight_bytes
    }

    /// Finds the lowest priority level at which the bytes in flight at the same or higher
    ///  priorities leave room for this grant. Lower priority bytes do not count because this
    ///  grant's packet will overtake them. A level occupied by a message with fewer bytes to
    ///  grant can not be skipped.
    fn lowest_possible_level(&self, rank: MessageRank, size_on_wire: u32) -> Option<usize> {
        let own_rank = self.current_rank(&rank.key).unwrap_or(rank);

        let own_sched: u64 = self.sched_in_flight.iter()
            .filter_map(|m| m.get(&own_rank))
            .sum();
        let others_per_level: Vec<u64> = self.sched_in_flight.iter()
            .map(|m| m.iter()
                .filter(|(r, _)| r.key != rank.key)
                .map(|(_, &bytes)| bytes)
                .sum())
            .collect();

        let budget = self.max_in_flight_bytes as i64 - self.unsched_in_flight_bytes as i64 - own_sched as i64;
        let mut cumulative: i64 = others_per_level.iter().sum::<u64>() as i64;

        for level in (0..self.sched_in_flight.len()).rev() {
            if cumulative + size_on_wire as i64 <= budget {
                return Some(level);
            }

            let head = self.sched_in_flight[level].keys()
                .find(|r| r.key != rank.key);
            if let Some(head) = head {
                if head.is_preferred_to(&rank) {
                    trace!("{:?} is blocked by {:?} at priority {}", rank.key, head.key, self.sched_prio(level));
                    return None;
                }
            }
            cumulative -= others_per_level[level] as i64;
        }
        None
    }

    fn commit_grant(&mut self, rank: MessageRank, grant_size: u32, size_on_wire: u32, level: usize) {
        let old_rank = self.current_rank(&rank.key).unwrap_or(rank);
        let new_rank = MessageRank {
            bytes_to_grant: rank.bytes_to_grant - grant_size,
            ..rank
        };

        let mut own_sched = 0;
        for m in self.sched_in_flight.iter_mut() {
            own_sched += m.remove(&old_rank).unwrap_or(0);
        }
        self.sched_in_flight[level].insert(new_rank, own_sched + size_on_wire as u64);

        for m in self.unsched_in_flight.iter_mut() {
            if let Some(bytes) = m.remove(&old_rank) {
                m.insert(new_rank, bytes);
            }
        }

        self.ranks.insert(rank.key, new_rank);
        self.total_outstanding_bytes += size_on_wire as u64;
    }

    /// Announces unscheduled bytes that a sender is going to send without grant
    pub fn unsched_pending_bytes(&mut self, rank: MessageRank, data_bytes: u32, pkt_type: PacketType, prio: u8) {
        if data_bytes == 0 {
            return;
        }
        let Some(per_message) = self.unsched_in_flight.get_mut(prio as usize) else {
            warn!("unscheduled bytes for {:?} at unsupported priority {} - ignoring", rank.key, prio);
            return;
        };

        let rank = *self.ranks.entry(rank.key).or_insert(rank);
        let size_on_wire = bytes_on_wire(data_bytes, pkt_type) as u64;
        *per_message.entry(rank).or_default() += size_on_wire;
        self.unsched_in_flight_bytes += size_on_wire;
        self.total_outstanding_bytes += size_on_wire;
    }

    /// Accounts for the arrival of a packet with `data_bytes` data bytes, releasing them from the
    ///  bytes in flight.
    ///
    /// A grant moves all of a message's scheduled bytes in flight to the grant's priority, so
    ///  packets granted earlier can arrive at a priority that no longer holds any of the
    ///  message's bytes. The same goes for unscheduled packets, which are announced at the
    ///  priority of the first packet to arrive. Bytes are released at the arrival priority first,
    ///  and from the message's other levels after that.
    pub fn bytes_arrived(&mut self, key: &MessageKey, data_bytes: u32, pkt_type: PacketType, prio: u8) {
        let size_on_wire = bytes_on_wire(data_bytes, pkt_type) as u64;

        let Some(rank) = self.current_rank(key) else {
            trace!("no bytes in flight for {:?}", key);
            return;
        };

        let released = match pkt_type {
            PacketType::Request | PacketType::UnschedData => {
                let arrival_level = (usize::from(prio) < self.unsched_in_flight.len()).then_some(usize::from(prio));
                let released = release_bytes(&mut self.unsched_in_flight, &rank, arrival_level, size_on_wire);
                self.unsched_in_flight_bytes -= released;
                released
            }
            PacketType::SchedData => {
                let arrival_level = self.sched_level(prio);
                release_bytes(&mut self.sched_in_flight, &rank, arrival_level, size_on_wire)
            }
            PacketType::Grant => 0,
        };

        if released < size_on_wire {
            trace!("{:?} bytes for {:?} at priority {}: released {} of {} bytes", pkt_type, key, prio, released, size_on_wire);
        }
        self.total_outstanding_bytes -= released;
    }

    /// Drops all accounting for a message, releasing any bytes that are still in flight
    pub fn forget(&mut self, key: &MessageKey) {
        let Some(rank) = self.ranks.remove(key) else {
            return;
        };

        for m in self.sched_in_flight.iter_mut() {
            if let Some(bytes) = m.remove(&rank) {
                self.total_outstanding_bytes -= bytes;
            }
        }
        for m in self.unsched_in_flight.iter_mut() {
            if let Some(bytes) = m.remove(&rank) {
                self.total_outstanding_bytes -= bytes;
                self.unsched_in_flight_bytes -= bytes;
            }
        }
    }
}

/// Releases up to `bytes` of a message's bytes in flight, starting at `first_level`. Returns the
///  number of bytes released.
fn release_bytes(levels: &mut [BTreeMap<MessageRank, u64>], rank: &MessageRank, first_level: Option<usize>, bytes: u64) -> u64 {
    let other_levels = (0..levels.len()).filter(|&level| Some(level) != first_level);

    let mut remaining = bytes;
    for level in first_level.into_iter().chain(other_levels) {
        if remaining == 0 {
            break;
        }
        let Some(in_flight) = levels[level].get_mut(rank) else {
            continue;
        };
        let released = remaining.min(*in_flight);
        *in_flight -= released;
        if *in_flight == 0 {
            levels[level].remove(rank);
        }
        remaining -= released;
    }
    bytes - remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload_estimator::WorkloadEstimator;
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::time::Duration;

    const SCHED_WIRE: u32 = 1538;

    fn config(mode: PacingMode, max_outstanding: u32) -> HomaConfig {
        let mut config = HomaConfig::default_config(SocketAddr::from(([10, 0, 0, 1], 9000)));
        config.pacing_mode = mode;
        config.max_outstanding_recv_bytes = max_outstanding;
        config
    }

    fn resolver(config: &HomaConfig) -> PriorityResolver {
        let workload = WorkloadEstimator::from_distribution(vec![(1000, 0.5), (100_000, 1.0)], u32::MAX).unwrap();
        PriorityResolver::new(config, &workload)
    }

    fn rank(sender: u8, bytes_to_grant: u32, msg_size: u32) -> MessageRank {
        MessageRank {
            bytes_to_grant,
            msg_size,
            key: MessageKey { sender: SocketAddr::from(([10, 0, 1, sender], 9000)), msg_id: 1 },
        }
    }

    #[test]
    fn test_rate_limited() {
        let config = config(PacingMode::NoOverCommit, 100_000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);

        let now = Instant::now();
        assert_eq!(pacer.get_grant(now, rank(1, 10_000, 20_000), 1454, &resolver), GrantDecision::Grant { prio: 7, size_on_wire: SCHED_WIRE });

        let until = now + Duration::from_nanos(1231);
        assert_eq!(pacer.get_grant(now, rank(2, 10_000, 20_000), 1454, &resolver), GrantDecision::RateLimited { until });
        assert_eq!(pacer.get_grant(until - Duration::from_nanos(1), rank(2, 10_000, 20_000), 1454, &resolver), GrantDecision::RateLimited { until });
        assert!(matches!(pacer.get_grant(until, rank(2, 10_000, 20_000), 1454, &resolver), GrantDecision::Grant { .. }));
    }

    #[test]
    fn test_no_over_commit() {
        let config = config(PacingMode::NoOverCommit, 5000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);

        let mut now = Instant::now();
        let mut bytes_to_grant = 20_000;
        for _ in 0..3 {
            assert_eq!(pacer.get_grant(now, rank(1, bytes_to_grant, 20_000), 1454, &resolver), GrantDecision::Grant { prio: 7, size_on_wire: SCHED_WIRE });
            assert!(pacer.total_outstanding_bytes() <= 5000);
            bytes_to_grant -= 1454;
            now += Duration::from_micros(2);
        }
        assert_eq!(pacer.total_outstanding_bytes(), 3 * SCHED_WIRE as u64);
        assert_eq!(pacer.get_grant(now, rank(1, bytes_to_grant, 20_000), 1454, &resolver), GrantDecision::OverBudget);

        pacer.bytes_arrived(&rank(1, 0, 0).key, 1454, PacketType::SchedData, 7);
        assert_eq!(pacer.total_outstanding_bytes(), 2 * SCHED_WIRE as u64);
        assert!(matches!(pacer.get_grant(now, rank(1, bytes_to_grant, 20_000), 1454, &resolver), GrantDecision::Grant { prio: 7, .. }));
    }

    #[test]
    fn test_unsched_bytes_count_against_budget() {
        let config = config(PacingMode::NoOverCommit, 3000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);
        let now = Instant::now();

        pacer.unsched_pending_bytes(rank(1, 10_000, 15_000), 2000, PacketType::UnschedData, 2);
        assert_eq!(pacer.unsched_in_flight_bytes(), 2188);
        assert_eq!(pacer.get_grant(now, rank(1, 10_000, 15_000), 1454, &resolver), GrantDecision::OverBudget);

        pacer.bytes_arrived(&rank(1, 0, 0).key, 1444, PacketType::UnschedData, 2);
        pacer.bytes_arrived(&rank(1, 0, 0).key, 556, PacketType::UnschedData, 2);
        assert_eq!(pacer.unsched_in_flight_bytes(), 0);
        assert_eq!(pacer.total_outstanding_bytes(), 0);
        assert!(matches!(pacer.get_grant(now, rank(1, 10_000, 15_000), 1454, &resolver), GrantDecision::Grant { .. }));
    }

    #[test]
    fn test_lowest_prio_possible() {
        let config = config(PacingMode::LowestPrioPossible, 3000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);
        let now = Instant::now();

        // the first grant goes to the lowest priority
        assert_eq!(pacer.get_grant(now, rank(1, 5000, 10_000), 1454, &resolver), GrantDecision::Grant { prio: 7, size_on_wire: SCHED_WIRE });

        // a bigger message must not overtake the smaller one
        let now = now + Duration::from_micros(2);
        assert_eq!(pacer.get_grant(now, rank(2, 8000, 12_000), 1454, &resolver), GrantDecision::OverBudget);

        // a smaller message gets a higher priority
        assert_eq!(pacer.get_grant(now, rank(3, 2000, 4000), 1454, &resolver), GrantDecision::Grant { prio: 6, size_on_wire: SCHED_WIRE });
        assert_eq!(pacer.sched_in_flight_at(6), SCHED_WIRE as u64);
        assert_eq!(pacer.sched_in_flight_at(7), SCHED_WIRE as u64);
    }

    #[test]
    fn test_lowest_prio_possible_merges_own_bytes() {
        let config = config(PacingMode::LowestPrioPossible, 4000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);
        let mut now = Instant::now();

        assert_eq!(pacer.get_grant(now, rank(1, 5000, 10_000), 1454, &resolver), GrantDecision::Grant { prio: 7, size_on_wire: SCHED_WIRE });
        now += Duration::from_micros(2);
        assert_eq!(pacer.get_grant(now, rank(1, 5000 - 1454, 10_000), 1454, &resolver), GrantDecision::Grant { prio: 7, size_on_wire: SCHED_WIRE });
        assert_eq!(pacer.sched_in_flight_at(7), 2 * SCHED_WIRE as u64);

        // the message's own bytes in flight use up the budget
        now += Duration::from_micros(2);
        assert_eq!(pacer.get_grant(now, rank(1, 5000 - 2 * 1454, 10_000), 1454, &resolver), GrantDecision::OverBudget);

        pacer.bytes_arrived(&rank(1, 0, 0).key, 1454, PacketType::SchedData, 7);
        assert_eq!(pacer.sched_in_flight_at(7), SCHED_WIRE as u64);
        assert!(matches!(pacer.get_grant(now, rank(1, 5000 - 2 * 1454, 10_000), 1454, &resolver), GrantDecision::Grant { prio: 7, .. }));
    }

    #[test]
    fn test_arrivals_after_level_change() {
        let config = config(PacingMode::LowestPrioPossible, 12_000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);
        let mut now = Instant::now();

        let big = rank(2, 200_000, 210_000);
        assert_eq!(pacer.get_grant(now, big, 1454, &resolver), GrantDecision::Grant { prio: 7, size_on_wire: SCHED_WIRE });

        // the small message's own bytes in flight eventually push it to a higher priority
        let mut grant_prios = Vec::new();
        let mut bytes_to_grant = 20_000;
        while grant_prios.last() != Some(&6) {
            now += Duration::from_micros(2);
            let GrantDecision::Grant { prio, .. } = pacer.get_grant(now, rank(1, bytes_to_grant, 30_000), 1454, &resolver) else {
                panic!("no grant after {:?}", grant_prios);
            };
            grant_prios.push(prio);
            bytes_to_grant -= 1454;
        }
        assert!(grant_prios.len() > 2);
        assert!(grant_prios[..grant_prios.len() - 1].iter().all(|&p| p == 7));
        assert_eq!(pacer.sched_in_flight_at(6), grant_prios.len() as u64 * SCHED_WIRE as u64);

        for prio in grant_prios {
            pacer.bytes_arrived(&rank(1, 0, 0).key, 1454, PacketType::SchedData, prio);
        }
        assert_eq!(pacer.sched_in_flight_at(6), 0);
        assert_eq!(pacer.sched_in_flight_at(7), SCHED_WIRE as u64);

        pacer.bytes_arrived(&big.key, 1454, PacketType::SchedData, 7);
        assert_eq!(pacer.total_outstanding_bytes(), 0);
        assert_eq!(pacer.sched_in_flight_at(7), 0);
    }

    #[test]
    fn test_unsched_arrival_at_other_priority() {
        let config = config(PacingMode::NoOverCommit, 100_000);
        let mut pacer = TrafficPacer::new(&config);

        pacer.unsched_pending_bytes(rank(1, 10_000, 15_000), 2888, PacketType::UnschedData, 2);
        pacer.bytes_arrived(&rank(1, 0, 0).key, 1444, PacketType::UnschedData, 2);
        pacer.bytes_arrived(&rank(1, 0, 0).key, 1444, PacketType::UnschedData, 3);
        assert_eq!(pacer.unsched_in_flight_bytes(), 0);
        assert_eq!(pacer.total_outstanding_bytes(), 0);
    }

    #[rstest]
    #[case::small_remainder(500, 6)]
    #[case::large_remainder(200_000, 7)]
    fn test_prio_from_cbf(#[case] bytes_to_grant: u32, #[case] expected_prio: u8) {
        let config = config(PacingMode::PrioFromCbf, 100_000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);

        let decision = pacer.get_grant(Instant::now(), rank(1, bytes_to_grant, bytes_to_grant + 10_000), bytes_to_grant.min(1454), &resolver);
        assert!(matches!(decision, GrantDecision::Grant { prio, .. } if prio == expected_prio), "{:?}", decision);
    }

    #[test]
    fn test_forget_releases_bytes_in_flight() {
        let config = config(PacingMode::NoOverCommit, 100_000);
        let resolver = resolver(&config);
        let mut pacer = TrafficPacer::new(&config);

        pacer.unsched_pending_bytes(rank(1, 10_000, 15_000), 1000, PacketType::Request, 0);
        pacer.get_grant(Instant::now(), rank(1, 10_000, 15_000), 1454, &resolver);
        assert!(pacer.total_outstanding_bytes() > 0);

        pacer.forget(&rank(1, 0, 0).key);
        assert_eq!(pacer.total_outstanding_bytes(), 0);
        assert_eq!(pacer.unsched_in_flight_bytes(), 0);
        assert_eq!(pacer.sched_in_flight_at(7), 0);
    }

    #[test]
    fn test_unknown_arrival_is_ignored() {
        let config = config(PacingMode::NoOverCommit, 100_000);
        let mut pacer = TrafficPacer::new(&config);

        pacer.bytes_arrived(&rank(1, 0, 0).key, 1000, PacketType::SchedData, 7);
        pacer.bytes_arrived(&rank(1, 0, 0).key, 1000, PacketType::UnschedData, 99);
        assert_eq!(pacer.total_outstanding_bytes(), 0);
    }
}
