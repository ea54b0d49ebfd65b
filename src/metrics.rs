use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::journal::SinkStats;
use crate::poller::PollState;
use crate::repository::ReplayStats;

/// Metrics registry for the agent scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    polling: PollMetrics,
    journal: JournalMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("waitmon".into()), None)?);

        let polling = PollMetrics::register(&registry)?;
        let journal = JournalMetrics::register(&registry)?;

        Ok(Self {
            registry,
            polling,
            journal,
        })
    }

    /// Record one sampling tick for an instance.
    pub fn observe_sample(&self, instance: &str, duration: Duration, success: bool) {
        let labels = &[instance];
        self.polling
            .sample_duration
            .with_label_values(labels)
            .observe(duration.as_secs_f64());
        if success {
            self.polling.samples_total.with_label_values(labels).inc();
        } else {
            self.polling
                .sample_errors_total
                .with_label_values(labels)
                .inc();
        }
    }

    pub fn inc_emission(&self, instance: &str) {
        self.polling
            .emissions_total
            .with_label_values(&[instance])
            .inc();
    }

    pub fn set_poll_state(&self, instance: &str, state: PollState) {
        self.polling
            .state
            .with_label_values(&[instance])
            .set(state.code());
    }

    /// Drop every series labelled with `instance`.
    pub fn forget_instance(&self, instance: &str) {
        let labels = &[instance];
        let _ = self.polling.sample_duration.remove_label_values(labels);
        let _ = self.polling.samples_total.remove_label_values(labels);
        let _ = self.polling.sample_errors_total.remove_label_values(labels);
        let _ = self.polling.emissions_total.remove_label_values(labels);
        let _ = self.polling.state.remove_label_values(labels);
    }

    pub fn set_journal_stats(&self, stats: SinkStats) {
        self.journal.writes.set(clamp(stats.writes));
        self.journal.write_errors.set(clamp(stats.errors));
        self.journal.dropped.set(clamp(stats.dropped));
    }

    pub fn record_replay(&self, stats: &ReplayStats) {
        let replay = &self.journal.replay_records;
        replay.with_label_values(&["used"]).set(clamp(stats.used));
        replay
            .with_label_values(&["skipped_old"])
            .set(clamp(stats.skipped_old));
        replay
            .with_label_values(&["malformed"])
            .set(clamp(stats.malformed));
        self.journal
            .replay_timed_out
            .set(if stats.timed_out { 1 } else { 0 });
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Clone)]
struct PollMetrics {
    sample_duration: HistogramVec,
    samples_total: IntCounterVec,
    sample_errors_total: IntCounterVec,
    emissions_total: IntCounterVec,
    state: IntGaugeVec,
}

impl PollMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let sample_duration = HistogramVec::new(
            HistogramOpts::new("sample_duration_seconds", "Wait sampling query duration")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["instance"],
        )?;
        registry.register(Box::new(sample_duration.clone()))?;

        let samples_total = IntCounterVec::new(
            Opts::new("samples_total", "Successful wait samples"),
            &["instance"],
        )?;
        registry.register(Box::new(samples_total.clone()))?;

        let sample_errors_total = IntCounterVec::new(
            Opts::new("sample_errors_total", "Failed wait samples"),
            &["instance"],
        )?;
        registry.register(Box::new(sample_errors_total.clone()))?;

        let emissions_total = IntCounterVec::new(
            Opts::new("emissions_total", "Snapshots handed to the repository"),
            &["instance"],
        )?;
        registry.register(Box::new(emissions_total.clone()))?;

        let state = IntGaugeVec::new(
            Opts::new(
                "poll_state",
                "Polling state (0=disconnected, 1=connecting, 2=connected, 3=retrying, 4=unsupported, 5=stopped)",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(state.clone()))?;

        Ok(Self {
            sample_duration,
            samples_total,
            sample_errors_total,
            emissions_total,
            state,
        })
    }
}

#[derive(Clone)]
struct JournalMetrics {
    writes: IntGauge,
    write_errors: IntGauge,
    dropped: IntGauge,
    replay_records: IntGaugeVec,
    replay_timed_out: IntGauge,
}

impl JournalMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let writes = IntGauge::with_opts(Opts::new(
            "journal_records_written",
            "Journal records written since start",
        ))?;
        registry.register(Box::new(writes.clone()))?;

        let write_errors = IntGauge::with_opts(Opts::new(
            "journal_write_errors",
            "Journal write failures since start",
        ))?;
        registry.register(Box::new(write_errors.clone()))?;

        let dropped = IntGauge::with_opts(Opts::new(
            "journal_records_dropped",
            "Snapshots not journaled because the write queue was full",
        ))?;
        registry.register(Box::new(dropped.clone()))?;

        let replay_records = IntGaugeVec::new(
            Opts::new("journal_replay_records", "Records seen by the startup replay"),
            &["outcome"],
        )?;
        registry.register(Box::new(replay_records.clone()))?;

        let replay_timed_out = IntGauge::with_opts(Opts::new(
            "journal_replay_timed_out",
            "Startup replay hit its deadline (1=yes)",
        ))?;
        registry.register(Box::new(replay_timed_out.clone()))?;

        Ok(Self {
            writes,
            write_errors,
            dropped,
            replay_records,
            replay_timed_out,
        })
    }
}
