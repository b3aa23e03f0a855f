//! Maps decoded events to metric points.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::tracer::event::{DecodedEvent, ExecEvent, ExecPhase, ReadlineEvent};

use super::point::{FieldValue, MetricPoint, NormalizeError};

/// Measurement for kernel-probe events.
pub const KPROBE_MEASUREMENT: &str = "kprobe";

/// Measurement for user-space probe events.
pub const UPROBE_MEASUREMENT: &str = "uprobe";

/// Ambient context stamped onto every point.
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    /// Capturing host identifier. Empty omits the `host` tag.
    pub host: String,
}

impl NormalizeContext {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

/// Build exactly one point from a decoded event.
///
/// `captured_at` is the wall-clock instant the record was decoded.
pub fn normalize(
    event: DecodedEvent,
    ctx: &NormalizeContext,
    captured_at: SystemTime,
) -> Result<MetricPoint, NormalizeError> {
    match event {
        DecodedEvent::Exec(ev) => exec_point(ev, ctx, captured_at),
        DecodedEvent::Readline(ev) => readline_point(ev, ctx, captured_at),
    }
}

fn base_tags(probe: &str, ctx: &NormalizeContext) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("probe".to_string(), probe.to_string());
    tags.insert("host".to_string(), ctx.host.clone());
    tags
}

fn exec_point(
    ev: ExecEvent,
    ctx: &NormalizeContext,
    captured_at: SystemTime,
) -> Result<MetricPoint, NormalizeError> {
    let mut fields = BTreeMap::new();
    fields.insert("comm".to_string(), FieldValue::String(ev.comm));
    // Rendered as a string so it stays a field and never becomes a series key.
    fields.insert("pid".to_string(), FieldValue::String(ev.pid.to_string()));
    fields.insert(
        "ppid".to_string(),
        FieldValue::Integer(i64::try_from(ev.ppid).unwrap_or(i64::MAX)),
    );
    fields.insert(
        "phase".to_string(),
        FieldValue::String(ev.phase.phase_type().as_str().to_string()),
    );

    match ev.phase {
        ExecPhase::Arg { argv } => {
            fields.insert("argv".to_string(), FieldValue::String(argv));
        }
        ExecPhase::Ret { retval } => {
            fields.insert("retval".to_string(), FieldValue::from(retval));
        }
    }

    MetricPoint::new(
        KPROBE_MEASUREMENT,
        base_tags("execve", ctx),
        fields,
        captured_at,
    )
}

fn readline_point(
    ev: ReadlineEvent,
    ctx: &NormalizeContext,
    captured_at: SystemTime,
) -> Result<MetricPoint, NormalizeError> {
    let mut fields = BTreeMap::new();
    fields.insert("pid".to_string(), FieldValue::from(ev.pid));
    fields.insert("command".to_string(), FieldValue::String(ev.line));

    MetricPoint::new(
        UPROBE_MEASUREMENT,
        base_tags("readline", ctx),
        fields,
        captured_at,
    )
}
