//! InfluxDB line protocol encoding.
//!
//! `measurement[,tag=value...] field=value[,field=value...] timestamp_ns`

use std::time::{SystemTime, UNIX_EPOCH};

use super::point::{FieldValue, MetricPoint};

/// Encode every point of a batch, one line each, newline-terminated.
pub fn encode_points(points: &[MetricPoint]) -> String {
    let mut buf = String::with_capacity(points.len() * 128);
    for point in points {
        encode_point(point, &mut buf);
        buf.push('\n');
    }
    buf
}

/// Append one point without a trailing newline.
pub fn encode_point(point: &MetricPoint, buf: &mut String) {
    escape_into(point.measurement(), &[',', ' '], buf);

    for (key, value) in point.tags() {
        buf.push(',');
        escape_into(key, &[',', '=', ' '], buf);
        buf.push('=');
        escape_into(value, &[',', '=', ' '], buf);
    }

    buf.push(' ');
    for (i, (key, value)) in point.fields().iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        escape_into(key, &[',', '=', ' '], buf);
        buf.push('=');
        encode_field_value(value, buf);
    }

    buf.push(' ');
    buf.push_str(&timestamp_ns(point.timestamp()).to_string());
}

fn encode_field_value(value: &FieldValue, buf: &mut String) {
    match value {
        FieldValue::Integer(v) => {
            buf.push_str(&v.to_string());
            buf.push('i');
        }
        FieldValue::Float(v) => buf.push_str(&v.to_string()),
        FieldValue::Boolean(v) => buf.push_str(if *v { "true" } else { "false" }),
        FieldValue::String(v) => {
            buf.push('"');
            for c in v.chars().map(fold_line_break) {
                if c == '"' || c == '\\' {
                    buf.push('\\');
                }
                buf.push(c);
            }
            buf.push('"');
        }
    }
}

/// Escape a measurement, key or tag value.
///
/// The server has no escape for a backslash here, so one that would end
/// the token or escape a delimiter is dropped.
fn escape_into(s: &str, special: &[char], buf: &mut String) {
    let mut chars = s.chars().map(fold_line_break).peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek().map_or(true, |next| special.contains(next)) {
            continue;
        }
        if special.contains(&c) {
            buf.push('\\');
        }
        buf.push(c);
    }
}

/// Line breaks terminate a point and have no escape sequence.
fn fold_line_break(c: char) -> char {
    match c {
        '\n' | '\r' => ' ',
        c => c,
    }
}

/// Nanoseconds since the Unix epoch; pre-epoch instants clamp to zero.
pub fn timestamp_ns(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
