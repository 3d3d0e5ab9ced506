//! Trace event model and JSONL parsing, batch and streaming (`3`, `4.6`, `6`).

use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use tracing::warn;

/// Known endpoint/method pairs the replay source can dispatch to. A closed
/// sum, per the design notes, with an explicit fallback instead of
/// open-ended reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    GetDatePicker,
    PostPickerStatus,
    GetCrossword,
    PostPlays,
    GetPuzzles,
    Unknown,
}

impl EndpointKind {
    pub fn classify(endpoint: &str, method: &str) -> Self {
        match (endpoint, method.to_uppercase().as_str()) {
            ("/date-picker", "GET") => EndpointKind::GetDatePicker,
            ("/postPickerStatus", "POST") => EndpointKind::PostPickerStatus,
            ("/crossword", "GET") => EndpointKind::GetCrossword,
            ("/api/v1/plays", "POST") => EndpointKind::PostPlays,
            ("/api/v1/puzzles", "GET") => EndpointKind::GetPuzzles,
            _ => EndpointKind::Unknown,
        }
    }
}

/// One line of the JSONL recording. `ts`, `endpoint`, `delayMs` are
/// required; everything else is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceEvent {
    pub ts: i64,
    pub endpoint: String,
    #[serde(rename = "delayMs")]
    pub delay_ms: i64,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub series: Option<String>,
    #[serde(rename = "puzzleId")]
    pub puzzle_id: Option<String>,
    pub offset: Option<i64>,
    #[serde(rename = "isLastReq")]
    pub is_last_req: Option<bool>,

    /// Assigned at parse time: the event's position in the stream.
    #[serde(skip)]
    pub index: usize,
}

fn default_method() -> String {
    "GET".to_string()
}

impl TraceEvent {
    pub fn kind(&self) -> EndpointKind {
        EndpointKind::classify(&self.endpoint, &self.method)
    }
}

/// Parses an entire trace file into memory. Malformed lines are silently
/// skipped, per `6`.
pub fn parse_trace_file(path: &Path) -> std::io::Result<Vec<TraceEvent>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut events = Vec::new();
    let mut index = 0usize;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceEvent>(&line) {
            Ok(mut event) => {
                event.index = index;
                index += 1;
                events.push(event);
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed trace line");
            }
        }
    }

    Ok(events)
}

/// Cumulative scaled dispatch offset in milliseconds from `T0`, per the
/// resolved replay timing basis: `dispatch_i = (Σ_{j≤i} delayMs_j) / s`.
pub fn cumulative_dispatch_offsets(events: &[TraceEvent], speed: f64) -> Vec<u64> {
    let mut cumulative = 0i64;
    let mut offsets = Vec::with_capacity(events.len());
    for event in events {
        cumulative += event.delay_ms.max(0);
        offsets.push((cumulative as f64 / speed).round() as u64);
    }
    offsets
}

/// A 100ms-bucketed histogram of concurrent events after scaling, used to
/// size the replay worker pool (`4.4`, `4.6`).
pub fn bucket_histogram(offsets: &[u64], bucket_ms: u64) -> Vec<usize> {
    if offsets.is_empty() {
        return Vec::new();
    }
    let max_offset = *offsets.iter().max().unwrap();
    let bucket_count = (max_offset / bucket_ms) as usize + 1;
    let mut histogram = vec![0usize; bucket_count];
    for &offset in offsets {
        let bucket = (offset / bucket_ms) as usize;
        histogram[bucket] += 1;
    }
    histogram
}

/// Peak concurrent-event count in any single 100ms bucket.
pub fn peak_bucket_count(offsets: &[u64]) -> usize {
    bucket_histogram(offsets, 100).into_iter().max().unwrap_or(0)
}

/// Chooses the replay worker-pool size: `max(20, peak * k)`, capped at
/// `ceiling` (`4.4`, invariant 7).
pub fn replay_pool_size(peak: usize, k: usize, ceiling: usize) -> usize {
    (20.max(peak.saturating_mul(k))).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_trace(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let file = write_trace(&[
            r#"{"ts":0,"endpoint":"/date-picker","delayMs":0}"#,
            "not json at all",
            r#"{"ts":100,"endpoint":"/crossword","delayMs":100}"#,
        ]);

        let events = parse_trace_file(file.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].index, 0);
        assert_eq!(events[1].index, 1);
    }

    #[test]
    fn cumulative_offsets_scale_by_speed() {
        let events = vec![
            TraceEvent {
                ts: 0,
                endpoint: "/date-picker".into(),
                delay_ms: 0,
                user_id: None,
                method: "GET".into(),
                series: None,
                puzzle_id: None,
                offset: None,
                is_last_req: None,
                index: 0,
            },
            TraceEvent {
                ts: 1000,
                endpoint: "/crossword".into(),
                delay_ms: 1000,
                user_id: None,
                method: "GET".into(),
                series: None,
                puzzle_id: None,
                offset: None,
                is_last_req: None,
                index: 1,
            },
            TraceEvent {
                ts: 2500,
                endpoint: "/api/v1/plays".into(),
                delay_ms: 1500,
                user_id: None,
                method: "POST".into(),
                series: None,
                puzzle_id: None,
                offset: None,
                is_last_req: None,
                index: 2,
            },
        ];

        let offsets = cumulative_dispatch_offsets(&events, 2.0);
        assert_eq!(offsets, vec![0, 500, 1250]);
    }

    #[test]
    fn replay_pool_size_respects_floor_and_ceiling() {
        assert_eq!(replay_pool_size(1, 5, 500), 20);
        assert_eq!(replay_pool_size(10, 5, 500), 50);
        assert_eq!(replay_pool_size(1000, 5, 500), 500);
    }

    #[test]
    fn classifies_known_endpoints() {
        assert_eq!(
            EndpointKind::classify("/date-picker", "GET"),
            EndpointKind::GetDatePicker
        );
        assert_eq!(
            EndpointKind::classify("/unknown-thing", "GET"),
            EndpointKind::Unknown
        );
    }
}
