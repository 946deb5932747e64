use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use tracing::debug;

use crate::config::WorkloadSource;
use crate::packet::{bytes_on_wire, PacketType};

/// tolerance for the final cumulative probability of a distribution
const PROB_EPSILON: f64 = 1e-6;

/// Size distribution statistics of the messages a host sends and receives, as a basis for
///  priority cutoffs.
///
/// The CDF holds `(size, cumulative probability)` pairs in ascending size order. The CBF holds
///  the cumulative share of bytes on the wire contributed by messages up to each size, normalized
///  to 1.0. Sizes are capped at `cbf_cap_msg_size` when calculating the CBF.
pub struct WorkloadEstimator {
    cdf: Vec<(u32, f64)>,
    cbf: Vec<(u32, f64)>,
    remain_size_cbf: Vec<(u32, f64)>,
    cbf_cap_msg_size: u32,
    observed: Option<ObservedSizes>,
}

struct ObservedSizes {
    histogram: BTreeMap<u32, u64>,
    recompute_every: u32,
    since_last_recompute: u32,
}

impl WorkloadEstimator {
    pub fn from_source(source: &WorkloadSource, cbf_cap_msg_size: u32) -> anyhow::Result<WorkloadEstimator> {
        match source {
            WorkloadSource::DeclaredFile(path) => Self::from_file(path, cbf_cap_msg_size),
            WorkloadSource::Declared(distribution) => Self::from_distribution(distribution.clone(), cbf_cap_msg_size),
            WorkloadSource::Observed { recompute_every } => Ok(Self::observed(*recompute_every, cbf_cap_msg_size)),
        }
    }

    pub fn from_file(path: &Path, cbf_cap_msg_size: u32) -> anyhow::Result<WorkloadEstimator> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading workload distribution {:?}", path))?;
        let (mean, distribution) = parse_distribution(&text)
            .with_context(|| format!("parsing workload distribution {:?}", path))?;
        debug!("loaded workload distribution {:?} with {} entries, mean message size {}", path, distribution.len(), mean);
        Self::from_distribution(distribution, cbf_cap_msg_size)
    }

    pub fn from_distribution(mut cdf: Vec<(u32, f64)>, cbf_cap_msg_size: u32) -> anyhow::Result<WorkloadEstimator> {
        validate_cdf(&cdf)?;
        if let Some(last) = cdf.last_mut() {
            last.1 = 1.0;
        }
        let cbf = build_cbf(&cdf, cbf_cap_msg_size);
        let remain_size_cbf = build_remain_size_cbf(&cdf, cbf_cap_msg_size);

        Ok(WorkloadEstimator {
            cdf,
            cbf,
            remain_size_cbf,
            cbf_cap_msg_size,
            observed: None,
        })
    }

    /// An estimator that starts without any data and learns from observed message sizes
    pub fn observed(recompute_every: u32, cbf_cap_msg_size: u32) -> WorkloadEstimator {
        WorkloadEstimator {
            cdf: Vec::new(),
            cbf: Vec::new(),
            remain_size_cbf: Vec::new(),
            cbf_cap_msg_size,
            observed: Some(ObservedSizes {
                histogram: BTreeMap::new(),
                recompute_every,
                since_last_recompute: 0,
            }),
        }
    }

    pub fn cdf(&self) -> &[(u32, f64)] {
        &self.cdf
    }

    pub fn cbf(&self) -> &[(u32, f64)] {
        &self.cbf
    }

    pub fn remain_size_cbf(&self) -> &[(u32, f64)] {
        &self.remain_size_cbf
    }

    /// Records a message size for live estimation, returning `true` if the distributions were
    ///  recomputed. A declared workload ignores observations.
    pub fn record_message_size(&mut self, msg_size: u32) -> bool {
        let Some(observed) = &mut self.observed else {
            return false;
        };

        *observed.histogram.entry(msg_size).or_default() += 1;
        observed.since_last_recompute += 1;
        if observed.since_last_recompute < observed.recompute_every {
            return false;
        }
        observed.since_last_recompute = 0;

        let total: u64 = observed.histogram.values().sum();
        let mut cumulative = 0;
        self.cdf = observed.histogram.iter()
            .map(|(&size, &count)| {
                cumulative += count;
                (size, cumulative as f64 / total as f64)
            })
            .collect();
        self.cbf = build_cbf(&self.cdf, self.cbf_cap_msg_size);
        self.remain_size_cbf = build_remain_size_cbf(&self.cdf, self.cbf_cap_msg_size);
        debug!("recomputed workload distribution from {} observed messages of {} distinct sizes", total, self.cdf.len());
        true
    }
}

/// Parses a workload distribution: The first line holds the distribution's mean message size,
///  every following line a message size and its cumulative probability, separated by whitespace.
///  Blank lines and lines starting with `#` are ignored.
pub fn parse_distribution(text: &str) -> anyhow::Result<(f64, Vec<(u32, f64)>)> {
    let mut lines = text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));

    let mean = lines.next()
        .ok_or_else(|| anyhow!("empty workload distribution"))?
        .parse::<f64>()
        .context("invalid mean message size")?;

    let mut distribution = Vec::new();
    for line in lines {
        let mut parts = line.split_whitespace();
        let (Some(size), Some(prob), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!("expected '<size> <probability>', was {:?}", line);
        };
        let size = size.parse::<f64>()
            .with_context(|| format!("invalid message size in {:?}", line))?;
        if !(1.0..=u32::MAX as f64).contains(&size) {
            bail!("message size out of range: {:?}", line);
        }
        let prob = prob.parse::<f64>()
            .with_context(|| format!("invalid probability in {:?}", line))?;
        distribution.push((size.round() as u32, prob));
    }

    validate_cdf(&distribution)?;
    Ok((mean, distribution))
}

fn validate_cdf(cdf: &[(u32, f64)]) -> anyhow::Result<()> {
    if cdf.is_empty() {
        bail!("workload distribution has no entries");
    }
    if cdf.windows(2).any(|w| w[0].0 >= w[1].0) {
        bail!("message sizes in a workload distribution must be strictly increasing");
    }
    if cdf.windows(2).any(|w| w[0].1 > w[1].1) {
        bail!("cumulative probabilities must not decrease");
    }
    if cdf.iter().any(|(_, p)| !(0.0..=1.0 + PROB_EPSILON).contains(p)) {
        bail!("cumulative probabilities must be between 0 and 1");
    }
    if let Some((_, last)) = cdf.last() {
        if (last - 1.0).abs() > PROB_EPSILON {
            bail!("final cumulative probability must be 1.0, was {}", last);
        }
    }
    Ok(())
}

fn build_cbf(cdf: &[(u32, f64)], cbf_cap_msg_size: u32) -> Vec<(u32, f64)> {
    let mut prev_prob = 0.0;
    let mut cumulative_bytes = 0.0;
    let mut cbf = Vec::with_capacity(cdf.len());
    for &(size, prob) in cdf {
        let wire_bytes = bytes_on_wire(size.min(cbf_cap_msg_size), PacketType::UnschedData) as f64;
        cumulative_bytes += wire_bytes * (prob - prev_prob);
        cbf.push((size, cumulative_bytes));
        prev_prob = prob;
    }

    if cumulative_bytes > 0.0 {
        for entry in cbf.iter_mut() {
            entry.1 /= cumulative_bytes;
        }
    }
    cbf
}

fn build_remain_size_cbf(cdf: &[(u32, f64)], cbf_cap_msg_size: u32) -> Vec<(u32, f64)> {
    let probabilities = cdf.iter()
        .scan(0.0, |prev_prob, &(size, prob)| {
            let delta = prob - *prev_prob;
            *prev_prob = prob;
            Some((size.min(cbf_cap_msg_size), delta))
        })
        .collect::<Vec<_>>();

    let wire_bytes_up_to = |remaining: u32| -> f64 {
        probabilities.iter()
            .map(|&(size, delta)| bytes_on_wire(size.min(remaining), PacketType::UnschedData) as f64 * delta)
            .sum()
    };

    let mut remain_size_cbf = cdf.iter()
        .map(|&(size, _)| (size, wire_bytes_up_to(size)))
        .collect::<Vec<_>>();

    let total = remain_size_cbf.last().map(|&(_, bytes)| bytes).unwrap_or(0.0);
    if total > 0.0 {
        for entry in remain_size_cbf.iter_mut() {
            entry.1 /= total;
        }
    }
    remain_size_cbf
}
