use tracing::debug;

use crate::config::{HomaConfig, PrioResolutionMode};
use crate::packet::PacketType;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::workload_estimator::WorkloadEstimator;

/// Maps message sizes to network priorities (0 being the highest priority).
///
/// Priorities are split into two bands: unscheduled packets (Request, UnscheduledData) use the
///  highest priorities `[0, sched_base)`, scheduled packets the remaining lowest priorities.
///  Within each band, the size distribution is split into priority levels of equal probability
///  mass, giving smaller messages higher priority.
pub struct PriorityResolver {
    mode: PrioResolutionMode,
    total_prio_levels: u16,
    sched_prio_base: u16,
    sched_prio_levels: u16,
    cdf_cutoffs: BandCutoffs,
    cbf_cutoffs: BandCutoffs,
    remain_size_cbf_cutoffs: BandCutoffs,
    explicit_cutoffs: Vec<u32>,
}

#[derive(Debug, Default)]
struct BandCutoffs {
    unsched: Vec<u32>,
    sched: Vec<u32>,
}

impl PriorityResolver {
    pub fn new(config: &HomaConfig, workload: &WorkloadEstimator) -> PriorityResolver {
        let explicit_cutoffs = match &config.prio_resolution_mode {
            PrioResolutionMode::Explicit(cutoffs) => with_unbounded_cutoff(cutoffs.clone()),
            _ => vec![u32::MAX],
        };

        let mut result = PriorityResolver {
            mode: config.prio_resolution_mode.clone(),
            total_prio_levels: config.total_priority_levels,
            sched_prio_base: config.sched_priority_base(),
            sched_prio_levels: config.sched_priority_levels,
            cdf_cutoffs: Default::default(),
            cbf_cutoffs: Default::default(),
            remain_size_cbf_cutoffs: Default::default(),
            explicit_cutoffs,
        };
        result.refresh(workload);
        result
    }

    /// Recalculates the cutoff tables after the workload distribution changed
    pub fn refresh(&mut self, workload: &WorkloadEstimator) {
        self.cdf_cutoffs = BandCutoffs {
            unsched: compute_cutoffs(workload.cdf(), self.sched_prio_base),
            sched: compute_cutoffs(workload.cdf(), self.sched_prio_levels),
        };
        self.cbf_cutoffs = BandCutoffs {
            unsched: compute_cutoffs(workload.cbf(), self.sched_prio_base),
            sched: compute_cutoffs(workload.cbf(), self.sched_prio_levels),
        };
        self.remain_size_cbf_cutoffs = BandCutoffs {
            unsched: compute_cutoffs(workload.remain_size_cbf(), self.sched_prio_base),
            sched: compute_cutoffs(workload.remain_size_cbf(), self.sched_prio_levels),
        };
        debug!("priority cutoffs from CDF: {:?}, from CBF: {:?}, from remaining size CBF: {:?}", self.cdf_cutoffs, self.cbf_cutoffs, self.remain_size_cbf_cutoffs);
    }

    pub fn mode(&self) -> &PrioResolutionMode {
        &self.mode
    }

    /// the priority for a packet of a message of size `msg_size`, using the configured mode
    pub fn prio_for_pkt(&self, msg_size: u32, pkt_type: PacketType) -> u8 {
        self.get_prio_for_pkt(&self.mode, msg_size, pkt_type)
    }

    pub fn get_prio_for_pkt(&self, mode: &PrioResolutionMode, msg_size: u32, pkt_type: PacketType) -> u8 {
        let band = match mode {
            PrioResolutionMode::FixedUnsched => return 0,
            PrioResolutionMode::FixedSched => return (self.total_prio_levels - 1).prechecked_cast(),
            PrioResolutionMode::StaticFromCdf => &self.cdf_cutoffs,
            PrioResolutionMode::StaticFromCbf => &self.cbf_cutoffs,
            PrioResolutionMode::StaticCbfGraduated => &self.remain_size_cbf_cutoffs,
            PrioResolutionMode::Explicit(_) => {
                return match pkt_type {
                    PacketType::Request | PacketType::UnschedData => prio_index(&self.explicit_cutoffs, msg_size)
                        .min(self.sched_prio_base - 1)
                        .prechecked_cast(),
                    PacketType::SchedData | PacketType::Grant => self.sched_prio(prio_index(&self.explicit_cutoffs, msg_size)),
                };
            }
        };

        match pkt_type {
            PacketType::Request | PacketType::UnschedData => prio_index(&band.unsched, msg_size).prechecked_cast(),
            PacketType::SchedData | PacketType::Grant => self.sched_prio(prio_index(&band.sched, msg_size)),
        }
    }

    /// The priorities of a message's unscheduled packets, given the data bytes of each packet
    ///  with the Request first.
    ///
    /// In graduated and explicit modes, each packet's priority is based on the bytes remaining in
    ///  the message when the packet is sent. All other modes use the message size for every packet.
    pub fn unsched_pkts_prio(&self, msg_size: u32, pkt_sizes: &[u32]) -> Vec<u8> {
        let graduated = matches!(self.mode, PrioResolutionMode::StaticCbfGraduated | PrioResolutionMode::Explicit(_));

        let mut remaining = msg_size;
        pkt_sizes.iter()
            .enumerate()
            .map(|(i, &pkt_bytes)| {
                let pkt_type = if i == 0 { PacketType::Request } else { PacketType::UnschedData };
                let size = if graduated { remaining } else { msg_size };
                remaining = remaining.saturating_sub(pkt_bytes);
                self.prio_for_pkt(size, pkt_type)
            })
            .collect()
    }

    fn sched_prio(&self, index_in_band: u16) -> u8 {
        (self.sched_prio_base + index_in_band.min(self.sched_prio_levels - 1)).prechecked_cast()
    }
}

/// Splits a cumulative distribution into `num_prios` bands of equal probability mass, returning
///  the largest size in each band. The returned cutoffs are strictly increasing, and the last one
///  is `u32::MAX` so that it covers all sizes.
pub fn compute_cutoffs(distribution: &[(u32, f64)], num_prios: u16) -> Vec<u32> {
    let mut cutoffs = Vec::with_capacity(num_prios.safe_cast());

    let mut i = 0;
    let mut prev_cutoff = None;
    for band in 1..num_prios {
        let boundary = band as f64 / num_prios as f64;
        while i < distribution.len() {
            let (size, cumulative) = distribution[i];
            if Some(size) == prev_cutoff {
                i += 1;
                continue;
            }
            if cumulative >= boundary {
                cutoffs.push(size);
                prev_cutoff = Some(size);
                break;
            }
            i += 1;
        }
    }

    with_unbounded_cutoff(cutoffs)
}

fn with_unbounded_cutoff(mut cutoffs: Vec<u32>) -> Vec<u32> {
    if cutoffs.last() != Some(&u32::MAX) {
        cutoffs.push(u32::MAX);
    }
    cutoffs
}

/// the index of the first cutoff that is at least `msg_size`
pub fn prio_index(cutoffs: &[u32], msg_size: u32) -> u16 {
    cutoffs.partition_point(|&c| c < msg_size)
        .min(cutoffs.len().saturating_sub(1))
        .prechecked_cast()
}
