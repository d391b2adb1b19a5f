//! Health prober
//!
//! Cheap, restart-triggering liveness: a process with the recorded pid must
//! exist and its command line must still match the unit's launch signature
//! (so a recycled pid is never mistaken for our unit — and a zombie, whose
//! cmdline reads empty, counts as dead).
//!
//! The escalated HTTP check is only consulted by `status`, never by the
//! restart loop; a transient HTTP hiccup in an otherwise-alive process must
//! not trigger a restart storm.

use serde::Deserialize;
use std::time::Duration;
use voxup_core::UnitRecord;

/// Liveness verdict from the process-table check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

/// Outcome of the escalated HTTP health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// 200 with a JSON body carrying a `status` field
    Healthy { status: String },
    Unhealthy { reason: String },
}

/// Check whether a process with this pid exists (signal 0).
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Like [`pid_alive`], but a zombie (exited, not yet reaped by its parent)
/// counts as dead: signal 0 still reaches it, while its cmdline reads
/// empty.
pub fn pid_running(pid: u32) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        std::fs::read(format!("/proc/{}/cmdline", pid))
            .map(|raw| !raw.is_empty())
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// Probe a unit record: pid exists and command line still matches the
/// launch signature.
pub fn probe_record(record: &UnitRecord) -> Liveness {
    let Some(pid) = record.pid else {
        return Liveness::Dead;
    };
    if !pid_alive(pid) {
        return Liveness::Dead;
    }
    if signature_matches(pid, &record.signature) {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}

/// Compare `/proc/<pid>/cmdline` against the launch signature. The first
/// element matches by basename suffix (the process may resolve to an
/// absolute path); the rest must match exactly, in order.
#[cfg(target_os = "linux")]
fn signature_matches(pid: u32, signature: &[String]) -> bool {
    let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", pid)) else {
        return false;
    };
    let argv: Vec<&str> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .filter_map(|part| std::str::from_utf8(part).ok())
        .collect();

    let Some(first) = signature.first() else {
        return !argv.is_empty();
    };
    if argv.len() < signature.len() {
        return false;
    }
    if !argv[0].ends_with(first.as_str()) {
        return false;
    }
    argv[1..signature.len()]
        .iter()
        .zip(&signature[1..])
        .all(|(a, s)| a == s)
}

/// Without /proc the signature cannot be confirmed; fall back to the pid
/// check alone.
#[cfg(not(target_os = "linux"))]
fn signature_matches(_pid: u32, _signature: &[String]) -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

/// Escalated check: `GET <url>` expecting 200 and a JSON `status` field.
pub async fn probe_http(url: &str) -> HealthVerdict {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return HealthVerdict::Unhealthy {
                reason: e.to_string(),
            }
        }
    };

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            return HealthVerdict::Unhealthy {
                reason: e.to_string(),
            }
        }
    };

    if !response.status().is_success() {
        return HealthVerdict::Unhealthy {
            reason: format!("HTTP {}", response.status()),
        };
    }

    match response.json::<HealthBody>().await {
        Ok(body) => HealthVerdict::Healthy {
            status: body.status,
        },
        Err(e) => HealthVerdict::Unhealthy {
            reason: format!("malformed health body: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxup_core::UnitRecord;

    #[test]
    fn record_without_pid_is_dead() {
        let record = UnitRecord::new("voice-agent", vec!["python3".to_string()]);
        assert_eq!(probe_record(&record), Liveness::Dead);
    }

    #[test]
    fn stale_pid_is_dead() {
        let mut record = UnitRecord::new("voice-agent", vec!["python3".to_string()]);
        // Far above any real pid_max, and still a positive i32
        record.pid = Some(999_999_999);
        assert_eq!(probe_record(&record), Liveness::Dead);
    }

    #[test]
    fn own_process_matches_own_signature() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let mut record = UnitRecord::new("t", vec!["sleep".to_string(), "30".to_string()]);
        record.pid = Some(child.id());
        assert_eq!(probe_record(&record), Liveness::Alive);

        // A different signature against the same pid must not match
        let mut wrong = UnitRecord::new("t", vec!["ngrok".to_string()]);
        wrong.pid = Some(child.id());
        assert_eq!(probe_record(&wrong), Liveness::Dead);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn killed_process_is_dead_after_reap() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        child.kill().unwrap();
        child.wait().unwrap();

        let mut record = UnitRecord::new("t", vec!["sleep".to_string(), "30".to_string()]);
        record.pid = Some(pid);
        assert_eq!(probe_record(&record), Liveness::Dead);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn zombie_counts_as_not_running() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        child.kill().unwrap();
        // Not reaped yet: the pid still answers signal 0 as a zombie
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(pid_alive(pid));
        assert!(!pid_running(pid));

        child.wait().unwrap();
    }

    #[tokio::test]
    async fn unreachable_health_endpoint_is_unhealthy() {
        // Port 9 (discard) is essentially never serving HTTP
        let verdict = probe_http("http://127.0.0.1:9/health").await;
        assert!(matches!(verdict, HealthVerdict::Unhealthy { .. }));
    }
}
