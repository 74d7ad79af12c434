use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Namespace shared with the official DogStatsD client telemetry.
const TELEMETRY_PREFIX: &str = "datadog.dogstatsd.client.";

const COUNTER_NAMES: [&str; 6] = [
    "metrics",
    "metrics_dropped",
    "bytes_sent",
    "bytes_dropped",
    "packets_sent",
    "packets_dropped",
];

/// Pipeline self-telemetry.
///
/// `Telemetry` accumulates counters describing the pipeline's own behavior: messages packed or dropped by the buffer,
/// and packets/bytes sent or dropped at the transport boundary. On its configured interval it is flushed into ordinary
/// messages which re-enter the very pipeline being measured: telemetry has no private delivery path, and is subject to
/// the same overflow policy as user metrics.
///
/// Counters are written from the worker thread and read from caller threads, so they are plain atomics.
pub(crate) struct Telemetry {
    flush_interval: Duration,
    last_flush: Mutex<Instant>,
    tags: String,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_dropped: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
}

impl Telemetry {
    /// Creates a `Telemetry` instance reporting over the given transport, tagged with the given global tags.
    pub fn new(flush_interval: Duration, transport_id: &'static str, global_tags: &[String]) -> Self {
        let mut tags = format!(
            "client:rust,client_version:{},client_transport:{}",
            env!("CARGO_PKG_VERSION"),
            transport_id
        );
        for tag in global_tags {
            tags.push(',');
            tags.push_str(tag);
        }

        Self {
            flush_interval,
            last_flush: Mutex::new(Instant::now()),
            tags,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        }
    }

    /// Tracks one message packed into a payload region.
    pub fn track_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Tracks one message lost to the overflow policy.
    pub fn track_message_dropped(&self, bytes_len: usize) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes_len as u64, Ordering::Relaxed);
    }

    /// Tracks a successful transport write.
    pub fn track_packet_sent(&self, bytes_len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_len as u64, Ordering::Relaxed);
    }

    /// Tracks a failed transport write.
    pub fn track_packet_dropped(&self, bytes_len: usize) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes_len as u64, Ordering::Relaxed);
    }

    /// Returns `true` once the configured flush interval has elapsed since the last flush.
    ///
    /// This is a cooperative check: there is no dedicated telemetry timer, the caller-facing send path evaluates it
    /// opportunistically.
    pub fn should_flush(&self) -> bool {
        self.last_flush.lock().elapsed() >= self.flush_interval
    }

    /// Captures the current counters, resets them to zero, and encodes the snapshot as messages.
    ///
    /// Capture and reset are a single atomic swap per counter, so increments racing the flush land in the next
    /// snapshot instead of being lost.
    pub fn flush(&self) -> Vec<String> {
        let snapshot = TelemetrySnapshot {
            counters: [
                self.messages_sent.swap(0, Ordering::Relaxed),
                self.messages_dropped.swap(0, Ordering::Relaxed),
                self.bytes_sent.swap(0, Ordering::Relaxed),
                self.bytes_dropped.swap(0, Ordering::Relaxed),
                self.packets_sent.swap(0, Ordering::Relaxed),
                self.packets_dropped.swap(0, Ordering::Relaxed),
            ],
        };
        *self.last_flush.lock() = Instant::now();

        snapshot.render(&self.tags)
    }

    /// Zeroes the counters and restamps the flush clock without producing a snapshot.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_dropped.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        *self.last_flush.lock() = Instant::now();
    }

    /// Returns `true` iff a payload region of `size` bytes is guaranteed to hold one full telemetry snapshot.
    ///
    /// Used at construction time to reject configurations where telemetry could never be reported.
    pub fn would_fit_in(&self, size: usize) -> bool {
        size >= self.worst_case_len()
    }

    /// Worst-case packed size of one snapshot: every counter at `u64::MAX`, separator included per line.
    pub fn worst_case_len(&self) -> usize {
        let worst = TelemetrySnapshot { counters: [u64::MAX; 6] };
        worst.render(&self.tags).iter().map(|line| line.len() + 1).sum()
    }

    #[cfg(test)]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
}

/// Immutable counter values captured at flush time.
struct TelemetrySnapshot {
    // Same order as `COUNTER_NAMES`.
    counters: [u64; 6],
}

impl TelemetrySnapshot {
    /// Encodes the snapshot as one DogStatsD counter line per counter.
    fn render(&self, tags: &str) -> Vec<String> {
        let mut formatter = itoa::Buffer::new();
        COUNTER_NAMES
            .iter()
            .zip(self.counters.iter())
            .map(|(name, value)| {
                let mut line = String::with_capacity(
                    TELEMETRY_PREFIX.len() + name.len() + 24 + 4 + tags.len(),
                );
                line.push_str(TELEMETRY_PREFIX);
                line.push_str(name);
                line.push(':');
                line.push_str(formatter.format(*value));
                line.push_str("|c|#");
                line.push_str(tags);
                line
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Telemetry;

    fn telemetry_with_tags(tags: &[&str]) -> Telemetry {
        let tags = tags.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        Telemetry::new(Duration::from_secs(10), "udp", &tags)
    }

    #[test]
    fn flush_renders_and_resets() {
        let telemetry = telemetry_with_tags(&[]);
        telemetry.track_message_sent();
        telemetry.track_message_sent();
        telemetry.track_packet_sent(140);
        telemetry.track_message_dropped(27);

        let expected_tags =
            format!("client:rust,client_version:{},client_transport:udp", env!("CARGO_PKG_VERSION"));

        let lines = telemetry.flush();
        assert_eq!(
            lines,
            vec![
                format!("datadog.dogstatsd.client.metrics:2|c|#{expected_tags}"),
                format!("datadog.dogstatsd.client.metrics_dropped:1|c|#{expected_tags}"),
                format!("datadog.dogstatsd.client.bytes_sent:140|c|#{expected_tags}"),
                format!("datadog.dogstatsd.client.bytes_dropped:27|c|#{expected_tags}"),
                format!("datadog.dogstatsd.client.packets_sent:1|c|#{expected_tags}"),
                format!("datadog.dogstatsd.client.packets_dropped:0|c|#{expected_tags}"),
            ]
        );

        // The flush zeroed everything.
        let lines = telemetry.flush();
        for line in lines {
            assert!(line.contains(":0|c|#"), "expected zeroed counter, got {line}");
        }
    }

    #[test]
    fn global_tags_appended() {
        let telemetry = telemetry_with_tags(&["env:prod", "region"]);
        let line = telemetry.flush().remove(0);
        assert!(line.ends_with(",env:prod,region"), "unexpected line {line}");
    }

    #[test]
    fn would_fit_in_boundary() {
        let telemetry = telemetry_with_tags(&["env:prod"]);
        let worst = telemetry.worst_case_len();

        assert!(!telemetry.would_fit_in(worst - 1));
        assert!(telemetry.would_fit_in(worst));
        assert!(telemetry.would_fit_in(worst + 1));
    }

    #[test]
    fn should_flush_tracks_interval() {
        let telemetry = telemetry_with_tags(&[]);
        assert!(!telemetry.should_flush());

        let eager = Telemetry::new(Duration::ZERO, "udp", &[]);
        assert!(eager.should_flush());
        eager.reset();
        assert!(eager.should_flush());
    }
}
