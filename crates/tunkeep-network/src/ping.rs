//! Reachability Checks
//!
//! ICMP pings through the system `ping` binary, the same way an
//! operator would check a peer by hand. The summary lines are parsed
//! into [`PingStats`]:
//!
//! ```text
//! 3 packets transmitted, 3 received, 0% packet loss, time 2003ms
//! rtt min/avg/max/mdev = 11.204/12.118/13.532/0.987 ms
//! ```

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Ping errors
#[derive(Debug, Clone, Error)]
pub enum PingError {
    #[error("Failed to run ping: {0}")]
    Spawn(String),

    #[error("Ping to {0} timed out")]
    Timeout(String),

    #[error("Unrecognized ping output: {0}")]
    Unparseable(String),
}

/// Result of one ping run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    /// Fraction lost, 0.0 to 1.0
    pub packet_loss: f64,
    pub rtt_min: f64,
    pub rtt_avg: f64,
    pub rtt_max: f64,
    pub rtt_stddev: f64,
}

impl PingStats {
    pub fn is_reachable(&self) -> bool {
        self.received > 0
    }
}

/// ICMP pinger
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Send `attempts` echo requests to `target`, waiting up to `timeout` for each reply
    async fn ping(&self, target: &str, attempts: u32, timeout: Duration) -> Result<PingStats, PingError>;
}

/// [`Pinger`] backed by the `ping` binary
#[derive(Debug, Clone, Default)]
pub struct SystemPinger;

#[async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, target: &str, attempts: u32, timeout: Duration) -> Result<PingStats, PingError> {
        let attempts = attempts.max(1);
        let wait_secs = timeout.as_secs().max(1);

        let mut cmd = Command::new("ping");
        cmd.args(["-n", "-q", "-c", &attempts.to_string(), "-W", &wait_secs.to_string()])
            .arg(target)
            .kill_on_drop(true);

        // One second between echoes plus the reply wait for the last one
        let overall = Duration::from_secs(u64::from(attempts) + wait_secs + 1);
        let output = tokio::time::timeout(overall, cmd.output())
            .await
            .map_err(|_| PingError::Timeout(target.to_string()))?
            .map_err(|e| PingError::Spawn(e.to_string()))?;

        // Exit status is non-zero on total loss; the summary is still valid
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stats = parse_ping_output(&stdout)?;
        debug!("ping {}: {}/{} received", target, stats.received, stats.transmitted);
        Ok(stats)
    }
}

/// Parse the summary printed by iputils, busybox or BSD `ping`
pub fn parse_ping_output(output: &str) -> Result<PingStats, PingError> {
    let mut stats = PingStats::default();
    let mut saw_summary = false;

    for line in output.lines() {
        let line = line.trim();

        if line.contains("packets transmitted") {
            for part in line.split(',') {
                let part = part.trim();
                let count = part
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<u32>().ok());
                if part.ends_with("packets transmitted") {
                    stats.transmitted = count.unwrap_or(0);
                    saw_summary = true;
                } else if part.ends_with("received") || part.ends_with("packets received") {
                    stats.received = count.unwrap_or(0);
                } else if part.ends_with("packet loss") {
                    stats.packet_loss = part
                        .split('%')
                        .next()
                        .and_then(|n| n.trim().parse::<f64>().ok())
                        .map(|pct| pct / 100.0)
                        .unwrap_or(0.0);
                }
            }
        } else if let Some((names, values)) = line.split_once('=') {
            if !names.contains("min/avg/max") {
                continue;
            }
            let values: Vec<f64> = values
                .trim()
                .trim_end_matches("ms")
                .trim()
                .split('/')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            if let [min, avg, max, rest @ ..] = values.as_slice() {
                stats.rtt_min = *min;
                stats.rtt_avg = *avg;
                stats.rtt_max = *max;
                stats.rtt_stddev = rest.first().copied().unwrap_or(0.0);
            }
        }
    }

    if !saw_summary {
        let first = output.lines().next().unwrap_or_default();
        return Err(PingError::Unparseable(first.to_string()));
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iputils_success() {
        let out = "PING 10.8.0.1 (10.8.0.1) 56(84) bytes of data.\n\
                   \n\
                   --- 10.8.0.1 ping statistics ---\n\
                   3 packets transmitted, 3 received, 0% packet loss, time 2003ms\n\
                   rtt min/avg/max/mdev = 11.204/12.118/13.532/0.987 ms\n";

        let stats = parse_ping_output(out).unwrap();
        assert_eq!(stats.transmitted, 3);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.packet_loss, 0.0);
        assert_eq!(stats.rtt_min, 11.204);
        assert_eq!(stats.rtt_avg, 12.118);
        assert_eq!(stats.rtt_max, 13.532);
        assert_eq!(stats.rtt_stddev, 0.987);
        assert!(stats.is_reachable());
    }

    #[test]
    fn test_parse_total_loss() {
        let out = "--- 10.8.0.1 ping statistics ---\n\
                   3 packets transmitted, 0 received, 100% packet loss, time 2040ms\n";

        let stats = parse_ping_output(out).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.packet_loss, 1.0);
        assert!(!stats.is_reachable());
    }

    #[test]
    fn test_parse_busybox_round_trip_line() {
        let out = "3 packets transmitted, 2 packets received, 33% packet loss\n\
                   round-trip min/avg/max = 9.1/10.2/11.3 ms\n";

        let stats = parse_ping_output(out).unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.rtt_max, 11.3);
        assert_eq!(stats.rtt_stddev, 0.0);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_ping_output("ping: unknown host").is_err());
    }
}
