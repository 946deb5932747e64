use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::packet::{bytes_on_wire, PacketType};

/// Decides how the receiver's traffic pacer picks priorities for scheduled packets, and how it
///  limits the number of bytes in flight towards the receiver.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacingMode {
    /// Grant only while the total of outstanding bytes stays within the configured budget, and
    ///  always at the lowest priority
    NoOverCommit,
    /// Grant at the lowest scheduled priority that keeps the bytes in flight at the same or higher
    ///  priorities within the budget. Higher priorities are used only if that is necessary and
    ///  does not displace a shorter message.
    LowestPrioPossible,
    /// Like [PacingMode::NoOverCommit], but the scheduled priority is derived from the bytes
    ///  distribution of the workload
    PrioFromCbf,
}
impl FromStr for PacingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NO_OVER_COMMIT" => Ok(PacingMode::NoOverCommit),
            "ADAPTIVE_LOWEST_PRIO_POSSIBLE" | "LOWEST_PRIO_POSSIBLE" => Ok(PacingMode::LowestPrioPossible),
            "PRIO_FROM_CBF" => Ok(PacingMode::PrioFromCbf),
            _ => bail!("unknown pacing mode {:?}", s),
        }
    }
}

/// Determines how message sizes are mapped to packet priorities
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PrioResolutionMode {
    /// priority bands split the workload's message count evenly
    StaticFromCdf,
    /// priority bands split the workload's bytes on the wire evenly
    StaticFromCbf,
    /// Like [PrioResolutionMode::StaticFromCbf], but each unscheduled packet's priority is
    ///  based on the bytes still remaining in its message, so that a message's later packets get
    ///  increasingly higher priority
    StaticCbfGraduated,
    /// everything is sent at the highest priority
    FixedUnsched,
    /// everything is sent at the lowest priority
    FixedSched,
    /// Configured cutoff sizes, strictly increasing. The final unbounded cutoff is implicit.
    Explicit(Vec<u32>),
}
impl FromStr for PrioResolutionMode {
    type Err = anyhow::Error;

    /// Parses the conventional mode names. Explicit cutoffs are written as
    ///  `EXPLICIT:100,1000,10000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(cutoffs) = s.strip_prefix("EXPLICIT:") {
            let cutoffs = cutoffs.split(',')
                .map(|c| c.trim().parse::<u32>().map_err(|e| anyhow!("invalid explicit cutoff {:?}: {}", c, e)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            return Ok(PrioResolutionMode::Explicit(cutoffs));
        }

        match s {
            "STATIC_FROM_CDF" => Ok(PrioResolutionMode::StaticFromCdf),
            "STATIC_FROM_CBF" => Ok(PrioResolutionMode::StaticFromCbf),
            "STATIC_CBF_GRADUATED" => Ok(PrioResolutionMode::StaticCbfGraduated),
            "FIXED_UNSCHED" => Ok(PrioResolutionMode::FixedUnsched),
            "FIXED_SCHED" => Ok(PrioResolutionMode::FixedSched),
            _ => bail!("unknown priority resolution mode {:?}", s),
        }
    }
}

/// Where the message size distribution comes from that priority cutoffs are derived from
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadSource {
    /// a distribution file: the mean size on the first line, followed by lines of
    ///  `<size> <cumulative probability>`
    DeclaredFile(PathBuf),
    /// (size, cumulative probability) pairs
    Declared(Vec<(u32, f64)>),
    /// The distribution is estimated from the sizes of messages sent and received by this
    ///  transport, and recomputed every `recompute_every` messages
    Observed { recompute_every: u32 },
}

pub struct HomaConfig {
    pub local_addr: SocketAddr,
    /// the port that peers listen on, used to address a host by IP address only
    pub dest_port: u16,

    /// NIC link speed in Gbit/s. The receiver paces grants to this speed.
    pub nic_link_speed_gbps: u32,
    /// Upper bound for the round trip time between any two hosts. Together with link speed, this
    ///  determines the burst of grants the receiver can issue at a time.
    pub max_rtt: Duration,

    /// The budget of bytes (on the wire) that a receiver allows to be in flight towards itself,
    ///  both unscheduled and granted bytes. This should be somewhat bigger than the link's
    ///  bandwidth-delay product.
    pub max_outstanding_recv_bytes: u32,
    /// The maximum number of data bytes per grant. Values beyond a single ScheduledData packet's
    ///  payload are reduced to that payload.
    pub grant_max_bytes: u32,
    /// The largest message this transport sends or accepts. A receiver allocates a message's
    ///  buffer when its first packet arrives, so this bounds the memory a single peer can claim.
    pub max_message_bytes: u32,

    /// The total number of network priorities available, at most 256.
    pub total_priority_levels: u16,
    /// The number of lowest priorities that are used for scheduled packets. The remaining higher
    ///  priorities are used for unscheduled packets.
    pub sched_priority_levels: u16,
    /// The number of senders that a receiver grants to concurrently. Only the shortest remaining
    ///  message of each of these senders is granted.
    pub num_senders_to_keep_granted: u16,

    /// The number of data bytes in a message's Request packet
    pub default_req_bytes: u32,
    /// The number of data bytes a sender transmits without grant after the Request packet
    pub default_unsched_bytes: u32,

    pub pacing_mode: PacingMode,
    pub prio_resolution_mode: PrioResolutionMode,
    /// message sizes are capped at this size when calculating the bytes distribution
    pub cbf_cap_msg_size: u32,
    pub workload: WorkloadSource,
}

impl HomaConfig {
    /// defaults for a 10 Gbit/s data center network with full Ethernet frames
    pub fn default_config(local_addr: SocketAddr) -> HomaConfig {
        HomaConfig {
            local_addr,
            dest_port: local_addr.port(),
            nic_link_speed_gbps: 10,
            max_rtt: Duration::from_micros(10),
            max_outstanding_recv_bytes: 15_000,
            grant_max_bytes: PacketType::SchedData.max_data_bytes(),
            max_message_bytes: 64 * 1024 * 1024,
            total_priority_levels: 8,
            sched_priority_levels: 2,
            num_senders_to_keep_granted: 2,
            default_req_bytes: 1_400,
            default_unsched_bytes: 4 * PacketType::UnschedData.max_data_bytes(),
            pacing_mode: PacingMode::LowestPrioPossible,
            prio_resolution_mode: PrioResolutionMode::StaticFromCbf,
            cbf_cap_msg_size: u32::MAX,
            workload: WorkloadSource::Observed { recompute_every: 1_000 },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nic_link_speed_gbps == 0 {
            bail!("link speed must be positive");
        }
        if self.max_rtt.is_zero() {
            bail!("max RTT must be positive");
        }
        if self.max_outstanding_recv_bytes == 0 {
            bail!("max outstanding receive bytes must be positive");
        }
        if self.grant_max_bytes == 0 {
            bail!("grant max bytes must be positive");
        }
        if self.max_message_bytes == 0 {
            bail!("max message bytes must be positive");
        }
        let full_packet_on_wire = bytes_on_wire(PacketType::SchedData.max_data_bytes(), PacketType::SchedData) as u128;
        if self.link_speed_bits_per_sec() as u128 * self.max_rtt.as_nanos() < full_packet_on_wire * 8_000_000_000 {
            bail!("link speed {} Gbit/s and max RTT {:?} do not allow a single full packet in flight", self.nic_link_speed_gbps, self.max_rtt);
        }

        if self.total_priority_levels < 2 || self.total_priority_levels > 256 {
            bail!("total priority levels must be between 2 and 256, was {}", self.total_priority_levels);
        }
        if self.sched_priority_levels == 0 || self.sched_priority_levels >= self.total_priority_levels {
            bail!("scheduled priority levels ({}) must be positive and leave at least one unscheduled level (total {})", self.sched_priority_levels, self.total_priority_levels);
        }
        if self.num_senders_to_keep_granted == 0 || self.num_senders_to_keep_granted > self.sched_priority_levels {
            bail!("number of senders to keep granted ({}) must be between 1 and the number of scheduled priority levels ({})", self.num_senders_to_keep_granted, self.sched_priority_levels);
        }

        if self.default_req_bytes == 0 {
            bail!("default request bytes must be positive");
        }
        if self.default_req_bytes > PacketType::Request.max_data_bytes() {
            bail!("default request bytes ({}) exceed the maximum payload of a request packet ({})", self.default_req_bytes, PacketType::Request.max_data_bytes());
        }

        if let PrioResolutionMode::Explicit(cutoffs) = &self.prio_resolution_mode {
            if cutoffs.windows(2).any(|w| w[0] >= w[1]) {
                bail!("explicit priority cutoffs must be strictly increasing: {:?}", cutoffs);
            }
            if cutoffs.len() >= self.unsched_priority_levels() as usize {
                bail!("{} explicit priority cutoffs do not fit into {} unscheduled priority levels", cutoffs.len(), self.unsched_priority_levels());
            }
        }

        if let WorkloadSource::Observed { recompute_every: 0 } = self.workload {
            bail!("workload recompute interval must be positive");
        }

        Ok(())
    }

    pub fn link_speed_bits_per_sec(&self) -> u64 {
        self.nic_link_speed_gbps as u64 * 1_000_000_000
    }

    pub fn unsched_priority_levels(&self) -> u16 {
        self.total_priority_levels - self.sched_priority_levels
    }

    /// the highest priority (i.e. numerically lowest) used for scheduled packets
    pub fn sched_priority_base(&self) -> u16 {
        self.unsched_priority_levels()
    }

    /// the address of a peer's Homa transport, assuming it listens on the configured port
    pub fn dest_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.dest_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> HomaConfig {
        HomaConfig::default_config(SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    #[test]
    fn test_default_is_valid() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.unsched_priority_levels(), 6);
        assert_eq!(config.sched_priority_base(), 6);
        assert_eq!(config.link_speed_bits_per_sec(), 10_000_000_000);
        assert_eq!(config.dest_addr(IpAddr::from([10, 0, 0, 7])), SocketAddr::from(([10, 0, 0, 7], 9000)));
    }

    #[rstest]
    #[case::no_link_speed(|c: &mut HomaConfig| c.nic_link_speed_gbps = 0)]
    #[case::no_max_message_size(|c: &mut HomaConfig| c.max_message_bytes = 0)]
    #[case::no_rtt(|c: &mut HomaConfig| c.max_rtt = Duration::ZERO)]
    #[case::rtt_below_one_packet(|c: &mut HomaConfig| c.max_rtt = Duration::from_nanos(1200))]
    #[case::single_prio(|c: &mut HomaConfig| c.total_priority_levels = 1)]
    #[case::too_many_prios(|c: &mut HomaConfig| c.total_priority_levels = 257)]
    #[case::no_sched_prio(|c: &mut HomaConfig| c.sched_priority_levels = 0)]
    #[case::no_unsched_prio(|c: &mut HomaConfig| c.sched_priority_levels = 8)]
    #[case::too_many_granted_senders(|c: &mut HomaConfig| c.num_senders_to_keep_granted = 3)]
    #[case::no_granted_senders(|c: &mut HomaConfig| c.num_senders_to_keep_granted = 0)]
    #[case::req_bytes_exceed_packet(|c: &mut HomaConfig| c.default_req_bytes = 1452)]
    #[case::explicit_not_increasing(|c: &mut HomaConfig| c.prio_resolution_mode = PrioResolutionMode::Explicit(vec![100, 100]))]
    #[case::explicit_too_many(|c: &mut HomaConfig| c.prio_resolution_mode = PrioResolutionMode::Explicit(vec![1, 2, 3, 4, 5, 6]))]
    #[case::no_recompute_interval(|c: &mut HomaConfig| c.workload = WorkloadSource::Observed { recompute_every: 0 })]
    fn test_validate_invalid(#[case] modify: fn(&mut HomaConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::no_over_commit("NO_OVER_COMMIT", Some(PacingMode::NoOverCommit))]
    #[case::adaptive("ADAPTIVE_LOWEST_PRIO_POSSIBLE", Some(PacingMode::LowestPrioPossible))]
    #[case::lowest("LOWEST_PRIO_POSSIBLE", Some(PacingMode::LowestPrioPossible))]
    #[case::cbf("PRIO_FROM_CBF", Some(PacingMode::PrioFromCbf))]
    #[case::unknown("FASTEST", None)]
    fn test_parse_pacing_mode(#[case] s: &str, #[case] expected: Option<PacingMode>) {
        assert_eq!(s.parse::<PacingMode>().ok(), expected);
    }

    #[rstest]
    #[case::cdf("STATIC_FROM_CDF", Some(PrioResolutionMode::StaticFromCdf))]
    #[case::cbf("STATIC_FROM_CBF", Some(PrioResolutionMode::StaticFromCbf))]
    #[case::cbf_graduated("STATIC_CBF_GRADUATED", Some(PrioResolutionMode::StaticCbfGraduated))]
    #[case::fixed_unsched("FIXED_UNSCHED", Some(PrioResolutionMode::FixedUnsched))]
    #[case::fixed_sched("FIXED_SCHED", Some(PrioResolutionMode::FixedSched))]
    #[case::explicit("EXPLICIT:100, 1000,10000", Some(PrioResolutionMode::Explicit(vec![100, 1000, 10000])))]
    #[case::explicit_garbage("EXPLICIT:100,abc", None)]
    #[case::unknown("STATIC_EXP_CDF", None)]
    fn test_parse_prio_resolution_mode(#[case] s: &str, #[case] expected: Option<PrioResolutionMode>) {
        assert_eq!(s.parse::<PrioResolutionMode>().ok(), expected);
    }
}
