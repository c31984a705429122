use std::time::Duration;

use hive_domain::ProbeResult;
use tokio::time::Instant;

use crate::link::{DroneLink, LinkTarget};

/// One command, three facts: load average, root disk usage, and whether the
/// worker process is up. Kept to a single round trip per probe.
const PROBE_COMMAND: &str = "cat /proc/loadavg; df -P / | tail -1; \
    pgrep -x hive-drone >/dev/null 2>&1 && echo worker=up || echo worker=down";

/// Run the liveness probe against `target`. Never returns an error: failures
/// become a failed [`ProbeResult`] so callers feed one shape into the health
/// and self-healing monitors.
pub async fn probe_target(
    link: &dyn DroneLink,
    target: &LinkTarget,
    timeout: Duration,
) -> ProbeResult {
    let started = Instant::now();
    match link.exec(target, PROBE_COMMAND, timeout).await {
        Ok(output) if output.success() => {
            let mut result = parse_probe_output(&output.stdout);
            result.rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
            result
        }
        Ok(output) => ProbeResult::failure(
            format!("probe exited {}: {}", output.exit_code, output.stderr.trim()),
            started.elapsed().as_secs_f64() * 1000.0,
        ),
        Err(e) => ProbeResult::failure(e.to_string(), started.elapsed().as_secs_f64() * 1000.0),
    }
}

fn parse_probe_output(stdout: &str) -> ProbeResult {
    let mut load_1m = None;
    let mut disk_percent = None;
    let mut worker_running = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with("worker=") {
            worker_running = Some(line == "worker=up");
        } else if line.contains('%') {
            // df -P: Filesystem Blocks Used Available Capacity Mounted
            disk_percent = line
                .split_whitespace()
                .find(|f| f.ends_with('%'))
                .and_then(|f| f.trim_end_matches('%').parse::<u8>().ok());
        } else if load_1m.is_none() {
            load_1m = line.split_whitespace().next().and_then(|f| f.parse().ok());
        }
    }

    ProbeResult {
        ok: true,
        load_1m,
        disk_percent,
        worker_running,
        rtt_ms: 0.0,
        error: None,
    }
}
