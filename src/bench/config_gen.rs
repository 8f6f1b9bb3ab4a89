//! Workload config rendering.
//!
//! Templates carry `$`-placeholders plus `hd=default` / `fsd=default` /
//! `fwd=default` markers and `tmp=fsd...` / `tmp=fwd...` block templates.
//! Rendering substitutes the placeholders, expands each marker into the
//! generated block right below it, and drops the template lines. The
//! result is a complete config the tool runs unmodified.
//!
//! All of this is pure text transformation; the controller fetches the
//! template from the master host and writes the rendered config back.

use crate::bench::SHARD_TREE_DEPTH;
use crate::error::{BenchError, Result};
use regex::Regex;

/// Everything the template placeholders resolve to.
#[derive(Debug, Clone)]
pub struct WorkloadParams<'a> {
    pub install_dir: &'a str,
    pub monitor_file: &'a str,
    /// Format mode for the run, e.g. `restart` or `clean`.
    pub format: &'a str,
    pub fwdrate: &'a str,
    pub elapsed: u64,
    pub shard_width: u32,
    pub shard_count: u32,
    pub thread_baseline: u32,
    pub multiple: u32,
    pub dir_depth: u32,
    pub anchor_path: &'a str,
    pub path_sep: char,
    /// Addresses of every host driving I/O, one `hd` slot each.
    pub clients: &'a [String],
}

impl WorkloadParams<'_> {
    /// Per-client thread count: the baseline rounded up to a multiple of
    /// `shard_count * multiple` so threads divide evenly across shards.
    pub fn client_threads(&self) -> u32 {
        let unit = self.shard_count * self.multiple;
        self.thread_baseline.div_ceil(unit) * unit
    }
}

/// Renders a workload template into a runnable config.
pub fn render_workload(template: &str, params: &WorkloadParams) -> Result<String> {
    if params.clients.is_empty() {
        return Err(BenchError::ConfigGeneration("no client hosts".into()));
    }

    let mut content = template
        .replace("$vdbench_dir", params.install_dir)
        .replace("$format", params.format)
        .replace("$fwdrate", params.fwdrate)
        .replace("$elapsed", &params.elapsed.to_string());

    let hd_block = hd_block(params);
    let fsd_templates = extract_templates(&content, "fsd");
    let fsd_block = fsd_block(params, &fsd_templates);
    let fwd_block = fwd_block(params, &content, fsd_templates.len())?;

    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        if line.contains("tmp=") {
            continue;
        }
        lines.push(line.to_string());
        if line.contains("hd=default") {
            lines.push(hd_block.clone());
        } else if line.contains("fsd=default") {
            lines.push(fsd_block.clone());
        } else if line.contains("fwd=default") {
            lines.push(fwd_block.clone());
        }
    }
    content = lines.join("\n");

    let threads = params.client_threads() * params.clients.len() as u32
        / fsd_templates.len().max(1) as u32;
    content = content.replace("$thread", &threads.to_string());

    for placeholder in ["$vdbench_dir", "$format", "$fwdrate", "$elapsed", "$width", "$depth", "$thread"] {
        if content.contains(placeholder) {
            return Err(BenchError::ConfigGeneration(format!(
                "unresolved placeholder {} in template",
                placeholder
            )));
        }
    }

    // Tolerate data errors, create anchors, silence message scanning, and
    // point the tool at its shutdown monitor file.
    Ok(format!(
        "data_errors=1,create_anchors=yes,messagescan=no,monitor={}\n{}\n",
        params.monitor_file, content
    ))
}

/// Captures the remainder of every `tmp=<kind>...` line. A template
/// without any yields one empty remainder so the block still expands.
fn extract_templates(content: &str, kind: &str) -> Vec<String> {
    let re = Regex::new(&format!(r"tmp={}(\S+)", kind)).unwrap();
    let found: Vec<String> = re
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect();
    if found.is_empty() {
        vec![String::new()]
    } else {
        found
    }
}

fn hd_block(params: &WorkloadParams) -> String {
    params
        .clients
        .iter()
        .enumerate()
        .map(|(n, addr)| format!("hd=hd{},system={}", n, addr))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One shard definition per (template, group) pair, each anchored at its
/// own `dir{n}` subtree nested `dir_depth` deep.
fn fsd_block(params: &WorkloadParams, templates: &[String]) -> String {
    let mut lines = Vec::new();
    for (index, template) in templates.iter().enumerate() {
        let template = template
            .replace("$width", &params.shard_width.to_string())
            .replace("$depth", &SHARD_TREE_DEPTH.to_string());
        for group in 0..params.shard_count {
            let n = index as u32 * params.shard_count + group;
            let mut anchor = params.anchor_path.to_string();
            for _ in 0..params.dir_depth {
                anchor = format!("{}{}dir{}", anchor, params.path_sep, n);
            }
            lines.push(format!("fsd=fsd{},anchor={}{}", n, anchor, template));
        }
    }
    lines.join("\n")
}

/// Workload definitions. Each template's `fsd=<n>` reference is widened to
/// the range of shards group `n` expanded into; `fsd=*` (or anything
/// non-numeric) targets every shard.
fn fwd_block(params: &WorkloadParams, content: &str, fsd_template_count: usize) -> Result<String> {
    let fsd_ref = Regex::new(r"fsd=([^,]+)").unwrap();
    let count = params.shard_count;
    let mut lines = Vec::new();
    for (i, template) in extract_templates(content, "fwd").iter().enumerate() {
        let (rest, fsd_info) = match fsd_ref.captures(template) {
            Some(caps) => {
                let target = caps[1].to_string();
                let rest = template.replace(&format!(",fsd={}", target), "");
                let info = match target.parse::<u32>() {
                    Ok(n) if count == 1 => format!("fsd=fsd{}", n),
                    Ok(n) => format!("fsd=(fsd{}-fsd{})", n * count, (n + 1) * count - 1),
                    Err(_) => full_range(fsd_template_count, count),
                };
                (rest, info)
            }
            None => (template.clone(), full_range(fsd_template_count, count)),
        };
        lines.push(format!("fwd=fwd{},{}{}", i, fsd_info, rest));
    }
    Ok(lines.join("\n"))
}

fn full_range(fsd_template_count: usize, shard_count: u32) -> String {
    let last = fsd_template_count as u32 * shard_count - 1;
    format!("fsd=(fsd0-fsd{})", last)
}

/// Turns a rendered config into its cleanup variant: the format phase
/// removes the existing file tree instead of reusing it.
pub fn with_clean_format(config: &str) -> String {
    Regex::new(r"(?m)format=.*$")
        .unwrap()
        .replace_all(config, "format=clean")
        .into_owned()
}

/// Turns a rendered config into its preparation variant by cutting the
/// measured phase down to `elapsed` seconds.
pub fn with_elapsed(config: &str, elapsed: u64) -> String {
    Regex::new(r"(?m)elapsed=.*$")
        .unwrap()
        .replace_all(config, format!("elapsed={}", elapsed).as_str())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
hd=default,vdbench=$vdbench_dir,user=root,shell=ssh
fsd=default,openflags=o_direct
tmp=fsd,depth=$depth,width=$width,files=100,size=128k
tmp=fsd,depth=$depth,width=$width,files=10,size=1m
fwd=default,xfersize=4k
tmp=fwd,fsd=0,operation=read,threads=$thread
tmp=fwd,fsd=1,operation=write,threads=$thread
rd=rd1,fwd=fwd*,fwdrate=$fwdrate,format=$format,elapsed=$elapsed,interval=1";

    fn params<'a>(clients: &'a [String]) -> WorkloadParams<'a> {
        WorkloadParams {
            install_dir: "/opt/vdb",
            monitor_file: "/tmp/out/measure/vdb.mon",
            format: "restart",
            fwdrate: "max",
            elapsed: 120,
            shard_width: 4,
            shard_count: 2,
            thread_baseline: 30,
            multiple: 2,
            dir_depth: 1,
            anchor_path: "/mnt/bench",
            path_sep: '/',
            clients,
        }
    }

    #[test]
    fn test_client_threads_round_up() {
        let clients = vec!["10.0.0.1".to_string()];
        let p = params(&clients);
        // 30 rounded up to a multiple of 2*2.
        assert_eq!(p.client_threads(), 32);
    }

    #[test]
    fn test_render_full_template() {
        let clients = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let rendered = render_workload(TEMPLATE, &params(&clients)).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(
            lines[0],
            "data_errors=1,create_anchors=yes,messagescan=no,monitor=/tmp/out/measure/vdb.mon"
        );
        assert_eq!(lines[1], "hd=default,vdbench=/opt/vdb,user=root,shell=ssh");
        assert_eq!(lines[2], "hd=hd0,system=10.0.0.1");
        assert_eq!(lines[3], "hd=hd1,system=10.0.0.2");
        // Two shard templates, two groups each.
        assert_eq!(
            lines[5],
            "fsd=fsd0,anchor=/mnt/bench/dir0,depth=4,width=4,files=100,size=128k"
        );
        assert_eq!(
            lines[6],
            "fsd=fsd1,anchor=/mnt/bench/dir1,depth=4,width=4,files=100,size=128k"
        );
        assert_eq!(
            lines[7],
            "fsd=fsd2,anchor=/mnt/bench/dir2,depth=4,width=4,files=10,size=1m"
        );
        assert_eq!(
            lines[8],
            "fsd=fsd3,anchor=/mnt/bench/dir3,depth=4,width=4,files=10,size=1m"
        );
        // Workload fsd references widened to the expanded ranges, threads
        // spread over 2 clients and 2 shard templates: 32 * 2 / 2.
        assert_eq!(lines[10], "fwd=fwd0,fsd=(fsd0-fsd1),operation=read,threads=32");
        assert_eq!(lines[11], "fwd=fwd1,fsd=(fsd2-fsd3),operation=write,threads=32");
        assert_eq!(
            lines[12],
            "rd=rd1,fwd=fwd*,fwdrate=max,format=restart,elapsed=120,interval=1"
        );
        assert!(!rendered.contains("tmp="));
    }

    #[test]
    fn test_render_deep_anchor() {
        let clients = vec!["10.0.0.1".to_string()];
        let mut p = params(&clients);
        p.dir_depth = 3;
        let rendered = render_workload(TEMPLATE, &p).unwrap();
        assert!(rendered.contains("anchor=/mnt/bench/dir0/dir0/dir0"));
    }

    #[test]
    fn test_render_rejects_unresolved_placeholder() {
        let clients = vec!["10.0.0.1".to_string()];
        // $width only resolves inside shard templates; one in a plain line
        // must be caught.
        let template = "fsd=default\nrd=rd1,width=$width,elapsed=$elapsed,fwdrate=$fwdrate,format=$format";
        let err = render_workload(template, &params(&clients)).unwrap_err();
        assert!(matches!(err, BenchError::ConfigGeneration(_)));
    }

    #[test]
    fn test_clean_and_prepare_variants() {
        let config = "rd=rd1,fwd=fwd*,format=restart\nrd=rd2,format=restart";
        assert_eq!(
            with_clean_format(config),
            "rd=rd1,fwd=fwd*,format=clean\nrd=rd2,format=clean"
        );
        let config = "rd=rd1,elapsed=7200,interval=1";
        assert_eq!(with_elapsed(config, 5), "rd=rd1,elapsed=5");
    }
}
