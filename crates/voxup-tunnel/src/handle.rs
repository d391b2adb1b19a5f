//! Handle for a running tunnel client process
//!
//! Captures the client's combined output into a bounded ring so discovery
//! can scan it and failures stay diagnosable without unbounded memory.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use voxup_core::ProviderKind;

use crate::provider::TunnelError;

/// Maximum retained output lines per tunnel process
const OUTPUT_RING_CAPACITY: usize = 200;

/// How long after spawn an exit counts as "exited immediately"
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(250);

type OutputRing = Arc<Mutex<VecDeque<String>>>;

/// A running tunnel client process
#[derive(Debug)]
pub struct TunnelHandle {
    child: Child,
    pid: Option<u32>,
    provider: ProviderKind,
    local_port: u16,
    output: OutputRing,
}

impl TunnelHandle {
    /// Spawn `cmd` with captured output, failing fast when the binary is
    /// missing or the process dies right away.
    pub(crate) async fn spawn(
        provider: ProviderKind,
        local_port: u16,
        cmd: &mut Command,
    ) -> Result<Self, TunnelError> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::ProviderUnavailable {
                provider: provider.binary().to_string(),
                reason: e.to_string(),
            })?;

        let output: OutputRing = Arc::new(Mutex::new(VecDeque::new()));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_lines(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_lines(stderr, output.clone()));
        }

        let pid = child.id();
        let mut handle = Self {
            child,
            pid,
            provider,
            local_port,
            output,
        };

        tokio::time::sleep(EARLY_EXIT_WINDOW).await;
        if handle.has_exited() {
            let reason = handle
                .recent_output()
                .last()
                .cloned()
                .unwrap_or_else(|| "process exited immediately".to_string());
            return Err(TunnelError::ProviderUnavailable {
                provider: provider.binary().to_string(),
                reason,
            });
        }

        Ok(handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the client process has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Snapshot of the retained output lines, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        self.output
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Kill the client process.
    pub async fn stop(mut self) -> Result<(), TunnelError> {
        self.child.kill().await?;
        Ok(())
    }
}

async fn capture_lines<R: AsyncRead + Unpin>(reader: R, ring: OutputRing) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut ring) = ring.lock() {
            if ring.len() == OUTPUT_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line);
        }
    }
}
