//! InfluxDB line protocol encoding.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=1.5,field2=0 1736929800000000000
//! ```

use crate::modules::ingest::point::TimePoint;

/// Renders one point; tags are sorted by key, the timestamp is in nanoseconds.
pub fn encode_point(point: &TimePoint) -> String {
    let mut line = escape_measurement(&point.measurement);

    let mut tags: Vec<&(String, String)> = point.tags.iter().collect();
    tags.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in tags {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    for (i, (metric, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(metric.as_str()));
        line.push('=');
        line.push_str(&value.to_string());
    }

    line.push(' ');
    line.push_str(&point.timestamp_nanos.to_string());
    line
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

/// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

/// Backslashes pass through untouched since the store only unescapes the
/// listed delimiters. Line breaks and tabs are written as `\n`, `\r` and
/// `\t` so a value can never end the line.
fn escape(s: &str, delimiters: &[char]) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if delimiters.contains(&c) => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}
