//! Service launcher
//!
//! Starts and stops supervised service processes, injecting discovered
//! tunnel URLs into their environment at launch time. Process identity is
//! persisted through the unit store so a later CLI invocation can locate
//! and terminate what an earlier one started.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use voxup_core::{
    ServiceSpec, SupervisorConfig, SupervisorError, UnitRecord, UnitStatus, UnitStore,
};

use crate::probe::{pid_running, probe_record, Liveness};

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period
    Stopped,
    /// Ignored the termination signal and was killed
    Forced,
    /// Nothing to stop; success, not an error
    NotRunning,
}

/// A URL resolved for injection, tagged with whether it is the local
/// fallback rather than a discovered public URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    pub fallback: bool,
}

/// Liveness poll interval while waiting out a graceful stop
const STOP_POLL: Duration = Duration::from_secs(1);

pub struct Launcher<'a> {
    config: &'a SupervisorConfig,
    store: &'a UnitStore,
}

impl<'a> Launcher<'a> {
    pub fn new(config: &'a SupervisorConfig, store: &'a UnitStore) -> Self {
        Self { config, store }
    }

    /// Launch signature for a service: the exact command line it is
    /// spawned with.
    pub fn service_signature(spec: &ServiceSpec) -> Vec<String> {
        let mut signature = vec![spec.command.clone()];
        signature.extend(spec.args.iter().cloned());
        signature
    }

    /// Resolve the URLs a service consumes from its bound tunnels' records,
    /// falling back to local addresses for anything not yet discovered.
    pub fn resolved_urls(
        &self,
        spec: &ServiceSpec,
    ) -> Result<BTreeMap<String, ResolvedUrl>, SupervisorError> {
        let mut urls = BTreeMap::new();
        for tunnel in self.config.tunnels_for_service(spec) {
            let binding = voxup_core::TunnelBinding {
                env_key: tunnel.env_key.clone(),
                scheme: tunnel.scheme,
            };
            let discovered = self
                .store
                .load(&tunnel.name)?
                .and_then(|record| record.public_url);
            let resolved = match discovered {
                Some(url) => ResolvedUrl {
                    url,
                    fallback: false,
                },
                None => ResolvedUrl {
                    url: binding.fallback_url(tunnel.local_port),
                    fallback: true,
                },
            };
            urls.insert(tunnel.env_key.clone(), resolved);
        }
        Ok(urls)
    }

    /// Start a service with the given URLs in its environment.
    ///
    /// Idempotent: when the recorded process is still alive and matches the
    /// launch signature, no second process is spawned and the existing
    /// record is returned with no child handle.
    pub async fn start_service(
        &self,
        spec: &ServiceSpec,
        urls: &BTreeMap<String, ResolvedUrl>,
    ) -> Result<(UnitRecord, Option<Child>), SupervisorError> {
        if let Some(existing) = self.store.load(&spec.name)? {
            if probe_record(&existing) == Liveness::Alive {
                info!(unit = %spec.name, pid = ?existing.pid, "already running");
                return Ok((existing, None));
            }
        }

        let signature = Self::service_signature(spec);
        let mut record = UnitRecord::new(&spec.name, signature);
        record.status = UnitStatus::Starting;
        self.store.save(&record)?;

        let log_dir = crate::logs_dir(&self.config.data_dir);
        std::fs::create_dir_all(&log_dir)?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(crate::unit_log_path(&self.config.data_dir, &spec.name))?;
        let log_file_err = log_file.try_clone()?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        let mut degraded = false;
        for (env_key, resolved) in urls {
            cmd.env(env_key, &resolved.url);
            degraded |= resolved.fallback;
            // WEBSOCKET_URL also implies WEBSOCKET_PORT etc., so children
            // bind the configured local port
            if let Some(stem) = env_key.strip_suffix("_URL") {
                cmd.env(format!("{}_PORT", stem), spec.port.to_string());
            }
        }

        let child = cmd.spawn().map_err(|source| {
            let _ = self.store.set_status(&spec.name, UnitStatus::Failed);
            SupervisorError::ProcessStartFailure {
                unit: spec.name.clone(),
                source,
            }
        })?;

        record.pid = child.id();
        record.env_urls = urls
            .iter()
            .map(|(k, v)| (k.clone(), v.url.clone()))
            .collect();
        // Only promote past `starting` once the probe confirms the process
        record.status = if probe_record(&record) == Liveness::Alive {
            if degraded {
                UnitStatus::Degraded
            } else {
                UnitStatus::Running
            }
        } else {
            UnitStatus::Starting
        };
        self.store.save(&record)?;

        info!(unit = %spec.name, pid = ?record.pid, status = %record.status, "started");
        Ok((record, Some(child)))
    }

    /// Stop a unit by its persisted record. Not-running is success.
    pub async fn stop_unit(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        let Some(record) = self.store.load(name)? else {
            return Ok(StopOutcome::NotRunning);
        };
        let Some(pid) = record.pid else {
            self.store.clear_pid(name, UnitStatus::Stopped)?;
            return Ok(StopOutcome::NotRunning);
        };
        if probe_record(&record) == Liveness::Dead {
            self.store.clear_pid(name, UnitStatus::Stopped)?;
            return Ok(StopOutcome::NotRunning);
        }

        let outcome = stop_pid(pid, self.config.grace_period()).await;
        self.store.clear_pid(name, UnitStatus::Stopped)?;
        info!(unit = %name, ?outcome, "stopped");
        Ok(outcome)
    }
}

/// Graceful stop: SIGTERM, poll liveness every second up to `grace`, then
/// SIGKILL.
pub async fn stop_pid(pid: u32, grace: Duration) -> StopOutcome {
    if !pid_running(pid) {
        return StopOutcome::NotRunning;
    }

    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        tokio::time::sleep(STOP_POLL).await;
        if !pid_running(pid) {
            return StopOutcome::Stopped;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
    }

    warn!(pid, "did not exit within grace period, sending SIGKILL");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    StopOutcome::Forced
}
