//! Signal extraction from benchmark tool logs.
//!
//! The tool communicates progress only through its log files, so stage
//! transitions, completion, performance dips and final averages are all
//! recovered by scanning log text. Everything here is pure; callers fetch
//! the text from the master host first.

use crate::error::{BenchError, Result};
use regex::Regex;
use serde::Serialize;

/// Observable run stages in the tool's own log vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The format pass that builds the file tree.
    Prepare,
    /// The measured workload pass.
    Measure,
}

impl Stage {
    /// Log keyword whose appearance announces the stage.
    pub fn keyword(&self) -> &'static str {
        match self {
            Stage::Prepare => "RD=format",
            Stage::Measure => "elapsed=",
        }
    }
}

/// True once the stage keyword has appeared and at least one timestamped
/// data line follows it. The keyword alone only announces intent; the
/// data line proves I/O is flowing.
pub fn stage_started(log: &str, stage: Stage) -> bool {
    let ts = Regex::new(r"\d{2}:\d{2}:\d{2}").unwrap();
    let mut seen_keyword = false;
    for line in log.lines() {
        if seen_keyword && ts.is_match(line) {
            return true;
        }
        if line.contains(stage.keyword()) {
            seen_keyword = true;
        }
    }
    false
}

/// The tool's estimate of the file structure it is about to build,
/// without the leading timestamp. With several anchors the totals line
/// summarizes them; otherwise any estimate line will do.
pub fn estimate_summary(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.lines().filter(|l| l.contains("Estimate")).collect();
    let line = lines
        .iter()
        .find(|l| l.contains("Estimated totals"))
        .or_else(|| lines.first())?;
    line.split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim().to_string())
}

///// Cuts the log down to the data table of the given stage: everything from
/// the stage keyword on, then from the column header line on.
pub fn trim_to_stage(log: &str, stage: Stage) -> Option<String> {
    let from_keyword = log.split_once(stage.keyword())?.1;
    let start = from_keyword
        .lines()
        .position(|l| l.to_lowercase().contains("interval"))?;
    Some(
        from_keyword
            .lines()
            .skip(start)
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Indexes of the per-operation rate columns in data rows.
///
/// The header names the rate columns; data rows carry two extra leading
/// tokens (timestamp and interval number), hence the offset of 2.
pub fn rate_columns(trimmed: &str) -> Result<Vec<usize>> {
    let header = trimmed
        .lines()
        .find(|l| l.contains("rate"))
        .ok_or_else(|| BenchError::Parse("no rate header in log data".into()))?;
    let cols: Vec<usize> = header
        .split_whitespace()
        .enumerate()
        .filter(|(_, token)| *token == "rate")
        .map(|(i, _)| i + 2)
        .collect();
    if cols.is_empty() {
        return Err(BenchError::Parse("no rate columns in log header".into()));
    }
    Ok(cols)
}

/// Data rows whose rate columns sum to zero.
///
/// A valid data row has exactly one column after the last rate column;
/// anything shorter or longer is a header or wrapped line and is skipped.
pub fn zero_rows<'a>(trimmed: &'a str, rate_cols: &[usize]) -> Vec<&'a str> {
    let expected = match rate_cols.last() {
        Some(last) => last + 2,
        None => return Vec::new(),
    };
    trimmed
        .lines()
        .filter(|line| {
            if line.contains("rate") {
                return false;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != expected {
                return false;
            }
            let sum: f64 = rate_cols
                .iter()
                .map(|&c| tokens[c].parse::<f64>().unwrap_or(0.0))
                .sum();
            sum == 0.0
        })
        .collect()
}

/// Timestamps of individual zero rows.
pub fn zero_timestamps(rows: &[&str]) -> Vec<String> {
    rows.iter()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// A stretch of consecutive intervals during which every rate column
/// stayed at zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZeroInterval {
    pub start: String,
    pub end: String,
    /// Number of zero intervals covered. With one-second log intervals this
    /// is the dip duration in seconds.
    pub seconds: u64,
}

/// Groups zero rows into runs of consecutive interval numbers and keeps
/// the runs spanning at least `threshold` seconds, longest first (ties
/// broken by start order). Requires one-second log intervals.
pub fn zero_intervals(rows: &[&str], threshold: u64) -> Vec<ZeroInterval> {
    let mut points: Vec<(u64, String)> = Vec::new();
    for line in rows {
        let mut tokens = line.split_whitespace();
        let (time, seq) = match (tokens.next(), tokens.next()) {
            (Some(t), Some(s)) => (t, s),
            _ => continue,
        };
        if let Ok(seq) = seq.parse::<u64>() {
            points.push((seq, time.to_string()));
        }
    }

    let mut runs: Vec<(u64, Vec<(u64, String)>)> = Vec::new();
    for point in points {
        match runs.last_mut() {
            Some((_, run)) if run.last().map(|(s, _)| s + 1) == Some(point.0) => run.push(point),
            _ => {
                let start = point.0;
                runs.push((start, vec![point]));
            }
        }
    }

    let mut intervals: Vec<(u64, ZeroInterval)> = runs
        .into_iter()
        .filter(|(_, run)| run.len() > 1)
        .map(|(start_seq, run)| {
            let seconds = run.len() as u64;
            (
                start_seq,
                ZeroInterval {
                    start: run.first().unwrap().1.clone(),
                    end: run.last().unwrap().1.clone(),
                    seconds,
                },
            )
        })
        .filter(|(_, iv)| iv.seconds >= threshold)
        .collect();
    intervals.sort_by(|a, b| b.1.seconds.cmp(&a.1.seconds).then(a.0.cmp(&b.0)));
    intervals.into_iter().map(|(_, iv)| iv).collect()
}

/// Averages reported on the tool's closing `avg` line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AvgValues {
    /// Operations per second.
    pub ops: f64,
    /// Mean response time in milliseconds.
    pub resp_ms: f64,
    /// Throughput in MB/s.
    pub bandwidth_mb: f64,
}

impl AvgValues {
    /// Bandwidth converted to GB/s for top-line reporting.
    pub fn bandwidth_gb(&self) -> f64 {
        self.bandwidth_mb / 1024.0
    }

    /// Operations per second rounded to the nearest integer.
    pub fn ops_rounded(&self) -> u64 {
        self.ops.round() as u64
    }
}

/// Extracts the run averages from the last `avg` line of the log.
pub fn avg_values(log: &str) -> Result<AvgValues> {
    let line = log
        .lines()
        .rev()
        .find(|l| l.contains("avg"))
        .ok_or_else(|| BenchError::Parse("no avg line in log".into()))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let field = |i: usize| -> Result<f64> {
        tokens
            .get(i)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| BenchError::Parse(format!("bad avg line: {}", line)))
    };
    Ok(AvgValues {
        ops: field(2)?,
        resp_ms: field(3)?,
        bandwidth_mb: field(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIMMED: &str = "\
Jan 01, 2026  .Interval.  .ReqstdOps..  ...cpu%...  ....read....  ....write....
                          rate   resp   total  sys  rate   resp   rate   resp
12:00:01.003     1       100.0  0.088   51.1  36.7  50.0  0.097   50.0  0.081
12:00:02.003     2         0.0  0.000   10.0   5.0   0.0  0.000    0.0  0.000
12:00:03.003     3         0.0  0.000   10.0   5.0   0.0  0.000    0.0  0.000
12:00:04.003     4       120.0  0.090   52.0  37.0  60.0  0.095   60.0  0.080";

    #[test]
    fn test_rate_columns_offset() {
        let cols = rate_columns(TRIMMED).unwrap();
        assert_eq!(cols, vec![2, 6, 8]);
    }

    #[test]
    fn test_zero_rows_filter() {
        let cols = rate_columns(TRIMMED).unwrap();
        let rows = zero_rows(TRIMMED, &cols);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("12:00:02.003"));
        assert_eq!(
            zero_timestamps(&rows),
            vec!["12:00:02.003".to_string(), "12:00:03.003".to_string()]
        );
    }

    #[test]
    fn test_zero_intervals_group_consecutive_runs_longest_first() {
        let rows: Vec<String> = [1, 2, 3, 7, 8, 9, 10]
            .iter()
            .map(|seq| format!("12:00:{:02}.003 {} 0.0 0.000 10.0 5.0 0.0 0.000 0.0 0.000", seq, seq))
            .collect();
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();

        let intervals = zero_intervals(&rows, 3);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].seconds, 4);
        assert_eq!(intervals[0].start, "12:00:07.003");
        assert_eq!(intervals[0].end, "12:00:10.003");
        assert_eq!(intervals[1].seconds, 3);
        assert_eq!(intervals[1].start, "12:00:01.003");

        // A higher threshold keeps only the long run; a lone zero row never
        // forms an interval.
        assert_eq!(zero_intervals(&rows, 4).len(), 1);
        assert!(zero_intervals(&rows[..1], 1).is_empty());
    }

    #[test]
    fn test_stage_started_needs_data_after_keyword() {
        let announced = "10:00:00.001 Starting RD=format\n";
        assert!(!stage_started(announced, Stage::Prepare));

        let flowing = "Starting RD=format\n10:00:01.001 1 100.0\n";
        assert!(stage_started(flowing, Stage::Prepare));

        let measuring = "Starting RD=rd1; elapsed=120 warmup=60\n10:05:01.001 1 100.0\n";
        assert!(stage_started(measuring, Stage::Measure));
        assert!(!stage_started(measuring, Stage::Prepare));
    }

    #[test]
    fn test_trim_to_stage() {
        let log = format!(
            "preamble\n10:00:00.001 Starting RD=rd1; elapsed=120\nnoise\n{}",
            TRIMMED
        );
        let trimmed = trim_to_stage(&log, Stage::Measure).unwrap();
        assert!(trimmed.starts_with("Jan 01, 2026"));
        assert!(trimmed.ends_with("0.080"));
        assert!(trim_to_stage("no such stage", Stage::Measure).is_none());
    }

    #[test]
    fn test_estimate_prefers_totals_line() {
        let log = "\
10:00:00.001 Estimate anchor=/mnt/a: 1000 files
10:00:00.002 Estimated totals: 2000 files, 128k each\n";
        assert_eq!(
            estimate_summary(log).unwrap(),
            "Estimated totals: 2000 files, 128k each"
        );
        assert!(estimate_summary("nothing here").is_none());
    }

    #[test]
    fn test_avg_values_from_closing_line() {
        let log = "\
12:02:00.001 95 1234.0 0.091 50.0 36.0 600.0 0.09 634.0 0.09 1 2 3 40.5
12:02:01.001 avg_61-120 1500.5 0.085 51.0 36.0 700.0 0.09 800.5 0.09 1 2 3 99.25\n";
        let avg = avg_values(log).unwrap();
        assert_eq!(avg.ops, 1500.5);
        assert_eq!(avg.resp_ms, 0.085);
        assert_eq!(avg.bandwidth_mb, 99.25);
        assert_eq!(avg.ops_rounded(), 1501);
        assert!((avg.bandwidth_gb() - 99.25 / 1024.0).abs() < 1e-12);
        assert!(avg_values("no averages").is_err());
    }
}
