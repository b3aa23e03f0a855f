use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::export::health::HealthMetrics;
use crate::pid::{self, ParentResolver};
use crate::sink::normalize::{normalize, NormalizeContext};
use crate::sink::{Batch, PointWriter};
use crate::tracer::event::ProbeKind;
use crate::tracer::parse;
use crate::tracer::stats::{Outcome, PumpStats};
use crate::tracer::RawRecord;

/// What the pump did with the records left in the channel when it exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    /// Records taken off the channel and run through the pipeline.
    pub processed: u64,
    /// Buffered records thrown away at shutdown.
    pub discarded: u64,
}

/// Moves records from the source channel to the sink, one point per batch.
///
/// Each record is decoded, enriched, normalized and written before the
/// next one is read, so sink order matches channel order. Every failure
/// drops exactly one record and the loop carries on.
pub struct Pump<W: PointWriter> {
    kind: ProbeKind,
    writer: Arc<W>,
    resolver: Arc<dyn ParentResolver>,
    ctx: NormalizeContext,
    database: String,
    retention_policy: String,
    drain_buffered: bool,
    stats: Arc<PumpStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl<W: PointWriter> Pump<W> {
    pub fn new(
        kind: ProbeKind,
        writer: Arc<W>,
        resolver: Arc<dyn ParentResolver>,
        ctx: NormalizeContext,
        database: impl Into<String>,
        retention_policy: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            writer,
            resolver,
            ctx,
            database: database.into(),
            retention_policy: retention_policy.into(),
            drain_buffered: false,
            stats: Arc::new(PumpStats::new()),
            health: None,
        }
    }

    /// Process records already queued in the channel before exiting on cancel.
    pub fn with_drain_buffered(mut self, drain: bool) -> Self {
        self.drain_buffered = drain;
        self
    }

    /// Share outcome counters with the caller (the stats reporter reads them).
    pub fn with_stats(mut self, stats: Arc<PumpStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn stats(&self) -> &Arc<PumpStats> {
        &self.stats
    }

    /// Run until `cancel` fires or every sender is gone.
    ///
    /// Cancellation is only observed between records: a record already
    /// dequeued always finishes its write.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<RawRecord>,
        cancel: CancellationToken,
    ) -> PumpSummary {
        let mut summary = PumpSummary::default();

        debug!(probe = %self.kind, "pump started");

        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = rx.recv() => record,
            };

            let Some(record) = record else {
                debug!(probe = %self.kind, "record channel closed");
                return summary;
            };

            if let Some(health) = &self.health {
                health.channel_length.set(rx.len() as f64);
            }

            self.process(&record).await;
            summary.processed += 1;
        }

        // Nothing new can arrive once the receiver is closed; what remains
        // is the backlog at the moment of cancellation.
        rx.close();

        if self.drain_buffered {
            while let Ok(record) = rx.try_recv() {
                self.process(&record).await;
                summary.processed += 1;
            }
        } else {
            while rx.try_recv().is_ok() {
                summary.discarded += 1;
            }
        }

        if summary.discarded > 0 {
            info!(
                probe = %self.kind,
                discarded = summary.discarded,
                "discarded buffered records on shutdown",
            );
        }

        debug!(probe = %self.kind, processed = summary.processed, "pump stopped");

        summary
    }

    /// Run one record through decode, enrich, normalize and write.
    pub async fn process(&self, record: &[u8]) -> Outcome {
        if let Some(health) = &self.health {
            health.records_received.inc();
        }

        let outcome = self.process_inner(record).await;

        self.stats.record(outcome);
        if let Some(health) = &self.health {
            health.record_outcome(outcome);
        }

        outcome
    }

    async fn process_inner(&self, record: &[u8]) -> Outcome {
        let event = match parse::decode(self.kind, record) {
            Ok(event) => event,
            Err(e) => {
                debug!(probe = %self.kind, error = %e, "dropping undecodable record");
                return Outcome::DecodeFailed;
            }
        };
        let captured_at = SystemTime::now();

        let event = pid::resolve_missing_parent(event, Arc::clone(&self.resolver)).await;
        let pid = event.pid();

        let point = match normalize(event, &self.ctx, captured_at) {
            Ok(point) => point,
            Err(e) => {
                warn!(probe = %self.kind, pid, error = %e, "dropping event that failed to normalize");
                return Outcome::NormalizeFailed;
            }
        };

        let mut batch = Batch::new(self.database.as_str(), self.retention_policy.as_str());
        batch.add_point(point);

        let start = Instant::now();
        let result = self.writer.write(&batch).await;
        if let Some(health) = &self.health {
            health
                .write_duration
                .observe(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                trace!(probe = %self.kind, pid, "point written");
                Outcome::Written
            }
            Err(e) => {
                warn!(
                    probe = %self.kind,
                    pid,
                    writer = self.writer.name(),
                    error = %e,
                    "dropping point after failed write",
                );
                Outcome::WriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::sink::point::{FieldValue, MetricPoint};
    use crate::sink::WriteError;
    use crate::tracer::parse::READLINE_RECORD_SIZE;

    /// Records every point; `fail` scripts per-write failures in call order.
    #[derive(Default)]
    struct RecordingWriter {
        points: Mutex<Vec<MetricPoint>>,
        fail: Mutex<VecDeque<bool>>,
    }

    impl PointWriter for RecordingWriter {
        fn name(&self) -> &str {
            "recording"
        }

        async fn write(&self, batch: &Batch) -> Result<(), WriteError> {
            assert_eq!(batch.len(), 1);
            assert_eq!(batch.database(), "telemetry");
            assert_eq!(batch.retention_policy(), "autogen");
            if self.fail.lock().pop_front().unwrap_or(false) {
                return Err(WriteError::Encode(std::io::Error::other("boom")));
            }
            self.points.lock().extend(batch.points().iter().cloned());
            Ok(())
        }
    }

    struct NoParent;

    impl ParentResolver for NoParent {
        fn parent_of(&self, _pid: u64) -> Option<u64> {
            None
        }
    }

    fn readline_record(pid: u32, line: &str) -> Vec<u8> {
        let mut buf = vec![0u8; READLINE_RECORD_SIZE];
        buf[..4].copy_from_slice(&pid.to_ne_bytes());
        buf[4..4 + line.len()].copy_from_slice(line.as_bytes());
        buf
    }

    fn pump(writer: Arc<RecordingWriter>) -> Pump<RecordingWriter> {
        Pump::new(
            ProbeKind::Readline,
            writer,
            Arc::new(NoParent),
            NormalizeContext::new("node-1"),
            "telemetry",
            "autogen",
        )
    }

    fn commands(writer: &RecordingWriter) -> Vec<String> {
        writer
            .points
            .lock()
            .iter()
            .filter_map(|p| match p.field("command") {
                Some(FieldValue::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_process_outcomes() {
        let writer = Arc::new(RecordingWriter::default());
        writer.fail.lock().extend([false, true]);
        let pump = pump(Arc::clone(&writer));

        assert_eq!(pump.process(&readline_record(1, "ls")).await, Outcome::Written);
        assert_eq!(pump.process(&readline_record(2, "pwd")).await, Outcome::WriteFailed);
        assert_eq!(pump.process(&[]).await, Outcome::DecodeFailed);

        assert_eq!(commands(&writer), vec!["ls"]);
        assert_eq!(pump.stats().total(Outcome::Written), 1);
        assert_eq!(pump.stats().total(Outcome::WriteFailed), 1);
        assert_eq!(pump.stats().total(Outcome::DecodeFailed), 1);
    }

    #[tokio::test]
    async fn test_run_preserves_order_and_survives_failures() {
        let writer = Arc::new(RecordingWriter::default());
        writer.fail.lock().extend([false, true, false]);
        let (tx, rx) = mpsc::channel(16);

        for (i, cmd) in ["one", "two", "three", "four"].iter().enumerate() {
            tx.send(readline_record(i as u32, cmd)).await.expect("send");
        }
        tx.send(vec![0u8; 3]).await.expect("send short");
        drop(tx);

        let summary = pump(Arc::clone(&writer))
            .run(rx, CancellationToken::new())
            .await;

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.discarded, 0);
        assert_eq!(commands(&writer), vec!["one", "three", "four"]);
    }

    #[tokio::test]
    async fn test_cancel_discards_backlog() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(16);
        for i in 0..3 {
            tx.send(readline_record(i, "queued")).await.expect("send");
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = pump(Arc::clone(&writer)).run(rx, cancel).await;

        assert_eq!(summary, PumpSummary { processed: 0, discarded: 3 });
        assert!(commands(&writer).is_empty());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_drains_backlog_when_configured() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, rx) = mpsc::channel(16);
        for cmd in ["a", "b"] {
            tx.send(readline_record(7, cmd)).await.expect("send");
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = pump(Arc::clone(&writer))
            .with_drain_buffered(true)
            .run(rx, cancel)
            .await;

        assert_eq!(summary, PumpSummary { processed: 2, discarded: 0 });
        assert_eq!(commands(&writer), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_health_counters() {
        let writer = Arc::new(RecordingWriter::default());
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let pump = pump(writer).with_health(Arc::clone(&health));

        pump.process(&readline_record(1, "ls")).await;
        pump.process(&[1, 2]).await;

        assert_eq!(health.records_received.get(), 2.0);
        assert_eq!(health.points_written.get(), 1.0);
        assert_eq!(
            health.records_dropped.with_label_values(&["decode"]).get(),
            1.0
        );
        assert_eq!(health.write_duration.get_sample_count(), 1);
    }
}
