//! Row selection by time range over in-memory log slices.

use crate::model::{LogRecord, TimeRange};

/// Half-open index span `[start, end)` of the records inside `tr`.
/// `None` means no record falls in the range. Unsorted slices (raw chunks)
/// are sorted by timestamp first; the unbounded range short-circuits without
/// sorting.
pub fn range_indices(
    logs: &mut [LogRecord],
    tr: TimeRange,
    sorted: bool,
) -> Option<(usize, usize)> {
    if tr.is_unbounded() {
        return Some((0, logs.len()));
    }
    if logs.is_empty() {
        return None;
    }
    if !sorted {
        logs.sort_by_key(|l| l.timestamp);
    }

    let first_ts = logs[0].timestamp;
    let last_ts = logs[logs.len() - 1].timestamp;
    if !tr.overlaps(&TimeRange::new(first_ts, last_ts)) {
        return None;
    }

    let start = if tr.start != 0 && first_ts < tr.start {
        logs.partition_point(|l| l.timestamp < tr.start)
    } else {
        0
    };
    let end = if tr.end != 0 && tr.end < last_ts {
        logs.partition_point(|l| l.timestamp <= tr.end)
    } else {
        logs.len()
    };

    Some((start, end))
}

/// Keep only the records inside `tr`.
pub fn clamp_to_range(mut logs: Vec<LogRecord>, tr: TimeRange, sorted: bool) -> Vec<LogRecord> {
    match range_indices(&mut logs, tr, sorted) {
        Some((start, end)) => {
            logs.truncate(end);
            logs.drain(..start);
            logs
        }
        None => Vec::new(),
    }
}

/// Keep only the records outside `tr`.
pub fn reject_range(mut logs: Vec<LogRecord>, tr: TimeRange, sorted: bool) -> Vec<LogRecord> {
    match range_indices(&mut logs, tr, sorted) {
        Some((start, end)) => {
            logs.drain(start..end);
            logs
        }
        None => logs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs_with_timestamps(timestamps: &[i64]) -> Vec<LogRecord> {
        timestamps
            .iter()
            .map(|ts| LogRecord {
                timestamp: *ts,
                ..LogRecord::default()
            })
            .collect()
    }

    struct Case {
        name: &'static str,
        tr: TimeRange,
        indices: Option<(usize, usize)>,
        in_range: usize,
    }

    #[test]
    fn index_spans() {
        let cases = [
            Case {
                name: "empty range",
                tr: TimeRange::default(),
                indices: Some((0, 6)),
                in_range: 6,
            },
            Case {
                name: "start and end in range",
                tr: TimeRange::new(2, 4),
                indices: Some((1, 4)),
                in_range: 3,
            },
            Case {
                name: "start in range",
                tr: TimeRange::new(3, 0),
                indices: Some((2, 6)),
                in_range: 4,
            },
            Case {
                name: "end in range",
                tr: TimeRange::new(0, 4),
                indices: Some((0, 4)),
                in_range: 4,
            },
            Case {
                name: "start out of range",
                tr: TimeRange::new(-1, 0),
                indices: Some((0, 6)),
                in_range: 6,
            },
            Case {
                name: "end out of range",
                tr: TimeRange::new(0, 8),
                indices: Some((0, 6)),
                in_range: 6,
            },
            Case {
                name: "not crossed",
                tr: TimeRange::new(8, 0),
                indices: None,
                in_range: 0,
            },
        ];

        for case in cases {
            let mut logs = logs_with_timestamps(&[1, 2, 3, 4, 5, 6]);
            assert_eq!(
                range_indices(&mut logs, case.tr, true),
                case.indices,
                "{}",
                case.name
            );

            let kept = clamp_to_range(logs.clone(), case.tr, true);
            assert_eq!(kept.len(), case.in_range, "{}", case.name);

            let rejected = reject_range(logs.clone(), case.tr, true);
            assert_eq!(rejected.len(), logs.len() - case.in_range, "{}", case.name);
        }
    }

    #[test]
    fn unsorted_input_is_sorted_first() {
        let mut logs = logs_with_timestamps(&[4, 1, 3, 2]);
        assert_eq!(range_indices(&mut logs, TimeRange::new(2, 3), false), Some((1, 3)));
        let sorted: Vec<i64> = logs.iter().map(|l| l.timestamp).collect();
        assert_eq!(sorted, vec![1, 2, 3, 4]);
    }

    #[test]
    fn reject_removes_the_middle() {
        let logs = logs_with_timestamps(&[5, 6, 7, 8]);
        let kept = reject_range(logs, TimeRange::new(6, 7), true);
        let timestamps: Vec<i64> = kept.iter().map(|l| l.timestamp).collect();
        assert_eq!(timestamps, vec![5, 8]);
    }
}
