use std::time::Duration;

/// Timings and counts recorded for one poll phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseStats {
    /// Time spent in the HTTP fetch.
    pub api_time: Duration,
    /// Time spent parsing the response.
    pub parse_time: Duration,
    /// Time spent post-processing (data phase only).
    pub calc_time: Duration,
    /// Metric values parsed, or schema entries seen.
    pub metrics: u64,
    /// Instances touched.
    pub instances: u64,
    /// Bytes received by the transport during this phase.
    pub bytes_rx: u64,
    /// HTTP calls made during this phase.
    pub num_calls: u64,
    /// Instance-metric pairs whose cooked value was dropped.
    pub skips: u64,
    /// Instances whose upstream aggregation was incomplete.
    pub num_partials: u64,
}

/// Per-phase collector metadata, read by the outer poller for cycle logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectorMetadata {
    pub counter: PhaseStats,
    pub instance: PhaseStats,
    pub data: PhaseStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zeroed() {
        let meta = CollectorMetadata::default();
        assert_eq!(meta.data.skips, 0);
        assert_eq!(meta.counter.metrics, 0);
        assert_eq!(meta.instance.api_time, Duration::ZERO);
    }
}
