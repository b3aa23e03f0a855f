pub mod pump;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::pid::{ParentResolver, ProcParentResolver};
use crate::sink::normalize::NormalizeContext;
use crate::sink::PointWriter;
use crate::tracer::stats::{Outcome, PumpStats};
use crate::tracer::RecordSource;

use self::pump::{Pump, PumpSummary};

/// Lifecycle of an [`Agent`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl AgentState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Running => 1.0,
            Self::Stopping => 2.0,
            Self::Stopped => 3.0,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("invalid agent transition from {from} to {to}")]
    InvalidTransition { from: AgentState, to: AgentState },
}

/// Agent wires a record source to a point writer through the pump and
/// owns their start/stop ordering.
pub struct Agent<S: RecordSource, W: PointWriter + 'static> {
    cfg: Config,
    source: S,
    writer: Arc<W>,
    resolver: Arc<dyn ParentResolver>,
    health: Arc<HealthMetrics>,
    stats: Arc<PumpStats>,
    state: AgentState,
    cancel: CancellationToken,
    pump: Option<JoinHandle<PumpSummary>>,
    summary: Option<PumpSummary>,
}

impl<S: RecordSource, W: PointWriter + 'static> Agent<S, W> {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config, source: S, writer: W) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            source,
            writer: Arc::new(writer),
            resolver: Arc::new(ProcParentResolver::new()),
            health,
            stats: Arc::new(PumpStats::new()),
            state: AgentState::Idle,
            cancel: CancellationToken::new(),
            pump: None,
            summary: None,
        })
    }

    /// Replace the `/proc` parent lookup used to complete exec events.
    pub fn with_resolver(mut self, resolver: Arc<dyn ParentResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn stats(&self) -> &Arc<PumpStats> {
        &self.stats
    }

    /// What the pump reported when it exited. Set once stopped.
    pub fn summary(&self) -> Option<PumpSummary> {
        self.summary
    }

    /// Start the source and the pump.
    ///
    /// The agent only enters `Running` once the source delivers its
    /// channel. On failure it stays `Idle` with the health server stopped.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != AgentState::Idle {
            return Err(AgentError::InvalidTransition {
                from: self.state,
                to: AgentState::Running,
            }
            .into());
        }

        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        self.health
            .channel_capacity
            .set(self.cfg.channel_capacity as f64);

        let kind = self.source.kind();
        let rx = match self.source.start().await {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(stop_err) = self.health.stop().await {
                    error!(error = %stop_err, "error stopping health metrics server");
                }
                return Err(e.context(format!("starting {kind} record source")));
            }
        };

        self.transition(AgentState::Idle, AgentState::Running)?;

        let pump = Pump::new(
            kind,
            Arc::clone(&self.writer),
            Arc::clone(&self.resolver),
            NormalizeContext::new(self.cfg.host.clone()),
            self.cfg.sink.database.clone(),
            self.cfg.sink.retention_policy.clone(),
        )
        .with_drain_buffered(self.cfg.shutdown.drain_buffered)
        .with_stats(Arc::clone(&self.stats))
        .with_health(Arc::clone(&self.health));

        self.pump = Some(tokio::spawn(pump.run(rx, self.cancel.child_token())));

        self.spawn_stats_reporter();

        info!(
            probe = %kind,
            host = %self.cfg.host,
            database = %self.cfg.sink.database,
            retention_policy = %self.cfg.sink.retention_policy,
            writer = self.writer.name(),
            "agent started",
        );

        Ok(())
    }

    /// Stop the source, let the in-flight record finish, and wait for the pump.
    pub async fn stop(&mut self) -> Result<()> {
        self.transition(AgentState::Running, AgentState::Stopping)?;

        info!("stopping agent");

        self.cancel.cancel();

        if let Err(e) = self.source.stop().await {
            error!(error = %e, "error stopping record source");
        }

        if let Some(handle) = self.pump.take() {
            match handle.await {
                Ok(summary) => self.summary = Some(summary),
                Err(e) => error!(error = %e, "pump task failed"),
            }
        }

        self.transition(AgentState::Stopping, AgentState::Stopped)?;

        let summary = self.summary.unwrap_or_default();
        info!(
            processed = self.stats.processed(),
            written = self.stats.total(Outcome::Written),
            decode_failed = self.stats.total(Outcome::DecodeFailed),
            normalize_failed = self.stats.total(Outcome::NormalizeFailed),
            write_failed = self.stats.total(Outcome::WriteFailed),
            discarded = summary.discarded,
            "agent stopped",
        );

        self.health.stop().await?;

        Ok(())
    }

    /// Resolves once the pump has exited, either on stop or because the
    /// source closed its channel.
    pub async fn pump_finished(&mut self) {
        if let Some(handle) = self.pump.as_mut() {
            match handle.await {
                Ok(summary) => self.summary = Some(summary),
                Err(e) => error!(error = %e, "pump task failed"),
            }
            self.pump = None;
        } else {
            std::future::pending::<()>().await;
        }
    }

    fn transition(&mut self, from: AgentState, to: AgentState) -> Result<(), AgentError> {
        if self.state != from {
            return Err(AgentError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        debug!(from = %from, to = %to, "agent state change");
        self.state = to;
        self.health.pipeline_state.set(to.gauge_value());

        Ok(())
    }

    /// Spawn background outcome stats reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        let dropped: u64 = snapshot
                            .iter()
                            .filter(|(o, _)| o.is_drop())
                            .map(|(_, n)| n)
                            .sum();

                        info!(
                            processed = total,
                            dropped,
                            interval = ?interval,
                            "pump stats",
                        );

                        for (outcome, count) in &snapshot {
                            debug!(outcome = %outcome, count, "  by outcome");
                        }
                    }
                }
            }
        });
    }
}
