//! Post-run report extraction.
//!
//! The tool ships its own `parseflat` subcommand that turns the binary-ish
//! `flatfile.html` into CSV. The aggregator drives it twice on the master
//! host (once for the interval series, once with `-a` for run averages),
//! trims the warm-up rows out of the series, and reads the closing
//! averages from the run log.

use crate::bench::JobPaths;
use crate::error::{BenchError, Result};
use crate::logsig::{self, AvgValues};
use crate::remote::RemoteHost;
use log::{debug, info};
use regex::Regex;
use serde::Serialize;

/// Series columns requested from `parseflat`.
const SERIES_COLUMNS: [&str; 5] = ["tod", "Run", "Interval", "Rate", "MB/sec"];

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// Remote path of the per-interval CSV, warm-up excluded.
    pub series_csv: String,
    /// Remote path of the averages CSV, warm-up included.
    pub avg_csv: String,
    pub averages: AvgValues,
}

pub struct MetricsAggregator<'a> {
    executable: &'a str,
    paths: &'a JobPaths,
    warmup: u64,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(executable: &'a str, paths: &'a JobPaths, warmup: u64) -> Self {
        Self {
            executable,
            paths,
            warmup,
        }
    }

    pub fn collect(&self, master: &mut RemoteHost) -> Result<MetricsReport> {
        let dir = self.paths.measure_dir();
        let flatfile = self.paths.flatfile(&dir);
        let series_csv = self.paths.join(&dir, "flat.csv");
        let avg_csv = self.paths.join(&dir, "avg_flat.csv");

        info!("Parsing performance data");
        self.parseflat(master, &flatfile, &SERIES_COLUMNS.join(" "), &series_csv, false)?;

        let parmscan = master.read_file(&self.paths.parmscan(&dir))?;
        let mut avg_columns: Vec<String> = SERIES_COLUMNS.iter().map(|c| c.to_string()).collect();
        for op in configured_operations(&parmscan) {
            avg_columns.push(format!("{}_rate", capitalize(&op)));
            if op == "read" || op == "write" {
                avg_columns.push(format!("MB_{}", op));
            }
        }
        self.parseflat(master, &flatfile, &avg_columns.join(" "), &avg_csv, true)?;

        let raw = master.read_file(&series_csv)?;
        let trimmed = drop_warmup_rows(&raw, self.warmup as usize)?;
        master.write_file(&series_csv, &trimmed)?;

        let logfile = master.read_file(&self.paths.logfile(&dir))?;
        let averages = logsig::avg_values(&logfile)?;
        debug!("Run averages: {:?}", averages);

        Ok(MetricsReport {
            series_csv,
            avg_csv,
            averages,
        })
    }

    fn parseflat(
        &self,
        master: &mut RemoteHost,
        input: &str,
        columns: &str,
        output: &str,
        averages: bool,
    ) -> Result<()> {
        let mut command = format!(
            "{} parseflat -i {} -c {} -o {}",
            self.executable, input, columns, output
        );
        if averages {
            command.push_str(" -a");
        }
        let out = master.exec(&command)?;
        if out.status != 0 {
            let logfile = self.paths.logfile(&self.paths.measure_dir());
            return Err(BenchError::Parse(format!(
                "File I/O operation may have failed, check log for details: {}",
                logfile
            )));
        }
        Ok(())
    }
}

/// Operations named by `operation=` / `operations=` entries in the
/// parameter scan, duplicates removed. A parenthesized value lists
/// several.
pub fn configured_operations(parmscan: &str) -> Vec<String> {
    let re = Regex::new(r"keyw.*operations?=(.*)").unwrap();
    let mut result: Vec<String> = Vec::new();
    for caps in re.captures_iter(parmscan) {
        let value = caps[1].trim();
        let ops: Vec<&str> = if value.starts_with('(') {
            value
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .collect()
        } else {
            vec![value]
        };
        for op in ops {
            let op = op.trim().to_string();
            if !op.is_empty() && !result.contains(&op) {
                result.push(op);
            }
        }
    }
    result
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Removes the first `warmup` data rows from a CSV, keeping the header.
fn drop_warmup_rows(raw: &str, warmup: usize) -> Result<String> {
    let mut reader = csv::Reader::from_reader(raw.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| BenchError::Parse(format!("series csv: {}", e)))?
        .clone();
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&headers)
        .map_err(|e| BenchError::Parse(format!("series csv: {}", e)))?;
    for record in reader.records().skip(warmup) {
        let record = record.map_err(|e| BenchError::Parse(format!("series csv: {}", e)))?;
        writer
            .write_record(&record)
            .map_err(|e| BenchError::Parse(format!("series csv: {}", e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| BenchError::Parse(format!("series csv: {}", e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, OsFamily};
    use crate::remote::transport::script::*;

    #[test]
    fn test_configured_operations() {
        let parmscan = "\
keyw: fwd=fwd0 operation=read
keyw: fwd=fwd1 operations=(mkdir,create,write)
keyw: fwd=fwd2 operation=read\n";
        assert_eq!(
            configured_operations(parmscan),
            vec!["read", "mkdir", "create", "write"]
        );
        assert!(configured_operations("nothing").is_empty());
    }

    #[test]
    fn test_drop_warmup_rows() {
        let raw = "tod,Rate\n1,10\n2,20\n3,30\n4,40\n";
        assert_eq!(drop_warmup_rows(raw, 2).unwrap(), "tod,Rate\n3,30\n4,40\n");
        // More warm-up than data leaves just the header.
        assert_eq!(drop_warmup_rows(raw, 9).unwrap(), "tod,Rate\n");
    }

    #[test]
    fn test_collect_drives_parseflat_and_trims() {
        let transport = ScriptedTransport::new(|cmd: &str| {
            if cmd.contains("parseflat") && cmd.ends_with("-a") {
                assert!(cmd.contains("Read_rate MB_read Write_rate MB_write"));
                Ok(ok_output(""))
            } else if cmd.contains("parseflat") {
                assert!(cmd.contains("-c tod Run Interval Rate MB/sec"));
                Ok(ok_output(""))
            } else if cmd.contains("parmscan.html") {
                Ok(ok_output("keyw: operations=(read,write)\n"))
            } else if cmd.contains("flat.csv") {
                Ok(ok_output("tod,Rate\n1,10\n2,0\n3,30\n"))
            } else if cmd.contains("logfile.html") {
                Ok(ok_output("12:00:01.001 avg_61-120 1500.5 0.085 1 2 3 4 5 6 7 8 9 99.25\n"))
            } else {
                panic!("unexpected command: {}", cmd);
            }
        });
        let mut config = HostConfig::new("10.0.0.1", "root", "master_host");
        config.os = Some(OsFamily::Posix);
        let mut master = RemoteHost::with_transport(config, Box::new(transport)).unwrap();

        let paths = JobPaths::new("/tmp/out", '/');
        let aggregator = MetricsAggregator::new("/opt/vdb/vdbench", &paths, 2);
        let report = aggregator.collect(&mut master).unwrap();

        assert_eq!(report.series_csv, "/tmp/out/measure/flat.csv");
        assert_eq!(report.averages.ops, 1500.5);
        assert_eq!(report.averages.bandwidth_mb, 99.25);
    }
}
