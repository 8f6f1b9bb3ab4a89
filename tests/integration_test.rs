use std::fs;
use tempfile::TempDir;

use fleetbench::bench::config_gen::{render_workload, with_clean_format, with_elapsed, WorkloadParams};
use fleetbench::config::{parse_duration_secs, Config};
use fleetbench::logsig::{self, Stage};

const CONFIG_YAML: &str = r#"
hosts:
  - address: "10.0.0.11"
    user: "root"
    password: "secret"
    role: "master_host"
    anchor_path: "/mnt/bench"
  - address: "10.0.0.12"
    user: "root"
    ssh_key: "~/.ssh/id_rsa"
    role: "host1"
    anchor_path: "/mnt/bench"
    os: "windows"
job:
  install_dir: "/opt/vdb"
  template: "/opt/vdb/templates/16k_rw.txt"
  output_dir: "/tmp/fleetbench"
  shard_width: 8
  shard_count: 3
  thread_baseline: 100
  multiple: 2
  elapsed: "2h"
  warmup: 30
"#;

#[test]
fn test_load_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.yaml");
    fs::write(&path, CONFIG_YAML).unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.hosts.len(), 2);
    assert_eq!(config.hosts[0].role, "master_host");
    assert_eq!(config.hosts[0].port, 22);
    assert_eq!(config.job.structure_tag(), "3&8");
    assert_eq!(config.job.elapsed_secs(180).unwrap(), 7200);
    // Unset fields fall back to their documented defaults.
    assert_eq!(config.job.fwdrate, "max");
    assert_eq!(config.job.dir_depth, 1);
    assert_eq!(config.job.zero_threshold, 3);
}

#[test]
fn test_load_config_rejects_two_masters() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.yaml");
    fs::write(&path, CONFIG_YAML.replace("host1", "master_host")).unwrap();
    assert!(Config::load(&path).is_err());
}

#[test]
fn test_duration_strings() {
    assert_eq!(parse_duration_secs("90").unwrap(), 90);
    assert_eq!(parse_duration_secs("15m").unwrap(), 900);
    assert_eq!(parse_duration_secs("1h").unwrap(), 3600);
    assert!(parse_duration_secs("soon").is_err());
}

#[test]
fn test_workload_rendering_and_variants() {
    let template = "\
hd=default
fsd=default
tmp=fsd,depth=$depth,width=$width,files=50,size=64k
fwd=default,xfersize=8k
tmp=fwd,fsd=0,operation=read,threads=$thread
rd=rd1,fwd=fwd*,fwdrate=$fwdrate,format=$format,elapsed=$elapsed,interval=1";

    let clients = vec!["10.0.0.11".to_string(), "10.0.0.12".to_string()];
    let params = WorkloadParams {
        install_dir: "/opt/vdb",
        monitor_file: "/tmp/fleetbench/measure/vdb.mon",
        format: "restart",
        fwdrate: "max",
        elapsed: 7200,
        shard_width: 8,
        shard_count: 3,
        thread_baseline: 100,
        multiple: 2,
        dir_depth: 1,
        anchor_path: "/mnt/bench",
        path_sep: '/',
        clients: &clients,
    };
    let rendered = render_workload(template, &params).unwrap();

    assert!(rendered.starts_with(
        "data_errors=1,create_anchors=yes,messagescan=no,monitor=/tmp/fleetbench/measure/vdb.mon"
    ));
    assert!(rendered.contains("hd=hd0,system=10.0.0.11"));
    assert!(rendered.contains("hd=hd1,system=10.0.0.12"));
    // 100 threads rounded up to a multiple of 3*2, then spread over two
    // clients and one shard template.
    assert!(rendered.contains("threads=204"));
    assert!(rendered.contains("fsd=fsd2,anchor=/mnt/bench/dir2,depth=4,width=8,files=50,size=64k"));
    assert!(rendered.contains("fwd=fwd0,fsd=(fsd0-fsd2),operation=read"));
    assert!(rendered.contains("elapsed=7200"));
    assert!(!rendered.contains("tmp="));

    let clean = with_clean_format(&rendered);
    assert!(clean.contains("format=clean"));
    assert!(!clean.contains("format=restart"));

    let prepare = with_elapsed(&rendered, 5);
    assert!(prepare.contains("elapsed=5"));
    assert!(!prepare.contains("elapsed=7200"));
}

#[test]
fn test_zero_interval_extraction_from_log() {
    let mut log = String::from(
        "10:00:00.001 Starting RD=rd1; elapsed=600 warmup=60\n\
         Jan 01, 2026  .Interval.  .ReqstdOps..  ....read....\n\
         \u{20}                         rate   resp   rate   resp\n",
    );
    for seq in 1..=12 {
        let rate = if (3..=5).contains(&seq) || (8..=11).contains(&seq) {
            0.0
        } else {
            250.0
        };
        log.push_str(&format!(
            "10:00:{:02}.001     {}       {:.1}  0.08   {:.1}  0.09\n",
            seq, seq, rate, rate
        ));
    }

    let trimmed = logsig::trim_to_stage(&log, Stage::Measure).unwrap();
    let cols = logsig::rate_columns(&trimmed).unwrap();
    assert_eq!(cols, vec![2, 4]);

    let rows = logsig::zero_rows(&trimmed, &cols);
    assert_eq!(rows.len(), 7);

    let intervals = logsig::zero_intervals(&rows, 3);
    assert_eq!(intervals.len(), 2);
    // Longest dip first.
    assert_eq!(intervals[0].seconds, 4);
    assert_eq!(intervals[0].start, "10:00:08.001");
    assert_eq!(intervals[1].seconds, 3);
    assert_eq!(intervals[1].start, "10:00:03.001");
}
