//! Kernel WireGuard log lines from the journal

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunkeep_tunnel::LogLine;

/// Split `wireguard: wg0: Receiving keepalive packet ...` into tag and message
pub fn parse_journal_line(line: &str) -> Option<LogLine> {
    let rest = line.split_once("wireguard: ")?.1;
    let (iface, message) = rest.split_once(": ")?;
    if iface.is_empty() || iface.contains(' ') {
        return None;
    }
    Some(LogLine {
        tag: iface.to_string(),
        message: message.trim().to_string(),
    })
}

/// Follow the kernel journal until `shutdown` fires or journalctl exits
pub async fn follow(logs: broadcast::Sender<LogLine>, shutdown: CancellationToken) {
    let mut child = match Command::new("journalctl")
        .args(["--dmesg", "--follow", "--lines=0", "--output=cat"])
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("Cannot follow the journal: {}", e);
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(parsed) = parse_journal_line(&line) {
                    let _ = logs.send(parsed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Journal read failed: {}", e);
                break;
            }
        }
    }
    debug!("Stopped following the journal");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_journal_line() {
        let line = parse_journal_line("wireguard: office: Receiving keepalive packet from peer 3 (203.0.113.9:51820)").unwrap();
        assert_eq!(line.tag, "office");
        assert!(line.message.starts_with("Receiving keepalive packet"));

        assert!(parse_journal_line("wireguard: WireGuard 1.0.0 loaded").is_none());
        assert!(parse_journal_line("usb 1-1: new device").is_none());
    }
}
