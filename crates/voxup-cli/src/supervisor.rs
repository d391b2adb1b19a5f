//! Supervisor loop
//!
//! Brings the configured units up (tunnels before the services that consume
//! their URLs), then ticks on a fixed interval: probe every unit, restart
//! what died, rediscover and propagate public URLs. Ticks never overlap and
//! restarts sharing a dependency are strictly ordered; only URL discovery
//! and graceful stops suspend, both with explicit timeouts.

use std::collections::HashMap;
use futures::future::join_all;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use url::Url;

use voxup_core::{
    BindingScheme, RestartPolicy, ServiceSpec, SupervisorConfig, SupervisorError, TimeoutPolicy,
    TunnelSpec, UnitRecord, UnitStatus, UnitStore,
};
use voxup_tunnel::{normalize_url, provider_for, spawn_args, TunnelError, TunnelHandle};

use crate::launcher::Launcher;
use crate::probe::{probe_record, Liveness};
use crate::twilio;

pub struct Supervisor {
    config: SupervisorConfig,
    store: UnitStore,
    /// Service children owned by this process, kept for exit notification
    /// (wait/reap) instead of pure table polling
    children: HashMap<String, Child>,
    /// Tunnel client handles owned by this process
    tunnels: HashMap<String, TunnelHandle>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let store = UnitStore::open(&config.data_dir)?;
        Ok(Self {
            config,
            store,
            children: HashMap::new(),
            tunnels: HashMap::new(),
        })
    }

    pub fn store(&self) -> &UnitStore {
        &self.store
    }

    /// One-shot bring-up: sweep stale recorded processes, start tunnels and
    /// discover their URLs, then start services with those URLs injected.
    pub async fn start_all(&mut self) -> Result<(), SupervisorError> {
        self.sweep_stale().await?;

        for spec in self.config.tunnels.clone() {
            match self.start_tunnel(&spec).await {
                Ok(()) => {}
                Err(e @ SupervisorError::UrlDiscoveryTimeout { .. }) => {
                    if self.config.on_discovery_timeout == TimeoutPolicy::Fail {
                        return Err(e);
                    }
                    warn!(unit = %spec.name, error = %e, "continuing degraded");
                }
                Err(e @ SupervisorError::ProviderUnavailable { .. }) => {
                    warn!(unit = %spec.name, error = %e, "tunnel unavailable, services will use local fallbacks");
                }
                Err(e) => return Err(e),
            }
        }

        for spec in self.config.services.clone() {
            self.start_service(&spec).await?;
        }

        self.log_banner()?;
        Ok(())
    }

    /// Run the control loop until an external stop signal, then stop every
    /// managed unit gracefully.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the bring-up just ran
        ticker.tick().await;

        info!(interval_secs = self.config.poll_interval_secs, "supervisor loop running");

        loop {
            // A signal arriving mid-tick cancels the tick, aborting any
            // in-flight discovery wait; stop_all then force-terminates
            // whatever was starting.
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
            }
        }

        self.stop_all().await;
        Ok(())
    }

    /// One supervision pass: probe everything, then heal in dependency
    /// order (tunnels first, then services).
    pub async fn tick(&mut self) {
        self.reap();

        let liveness = self.probe_all().await;

        for spec in self.config.tunnels.clone() {
            let alive = liveness.get(&spec.name) == Some(&Liveness::Alive);
            if alive {
                self.rediscover_if_unresolved(&spec).await;
                continue;
            }
            if let Err(e) = self.mark_dead(&spec.name) {
                warn!(unit = %spec.name, error = %e, "probe bookkeeping failed");
                continue;
            }
            if self.should_restart(&spec.name, spec.restart) {
                info!(unit = %spec.name, "tunnel dead, restarting");
                if let Err(e) = self.start_tunnel(&spec).await {
                    warn!(unit = %spec.name, error = %e, "tunnel restart failed, retrying next tick");
                }
            }
        }

        for spec in self.config.services.clone() {
            let alive = liveness.get(&spec.name) == Some(&Liveness::Alive);
            if !alive {
                if let Err(e) = self.mark_dead(&spec.name) {
                    warn!(unit = %spec.name, error = %e, "probe bookkeeping failed");
                    continue;
                }
                if self.should_restart(&spec.name, spec.restart) {
                    info!(unit = %spec.name, "service dead, restarting");
                    if let Err(e) = self.start_service(&spec).await {
                        warn!(unit = %spec.name, error = %e, "service restart failed, retrying next tick");
                    }
                }
                continue;
            }

            match self.url_drift(&spec) {
                Ok(true) => {
                    info!(unit = %spec.name, "public URL changed, restarting to pick it up");
                    if let Err(e) = self.restart_service(&spec).await {
                        warn!(unit = %spec.name, error = %e, "restart after URL change failed");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(unit = %spec.name, error = %e, "could not check URL bindings"),
            }
        }
    }

    /// Gracefully stop every managed unit: services first, then the
    /// tunnels they depend on.
    pub async fn stop_all(&mut self) {
        for spec in self.config.services.clone() {
            let launcher = Launcher::new(&self.config, &self.store);
            if let Err(e) = launcher.stop_unit(&spec.name).await {
                warn!(unit = %spec.name, error = %e, "stop failed");
            }
            if let Some(mut child) = self.children.remove(&spec.name) {
                let _ = child.wait().await;
            }
        }

        for spec in self.config.tunnels.clone() {
            let launcher = Launcher::new(&self.config, &self.store);
            if let Err(e) = launcher.stop_unit(&spec.name).await {
                warn!(unit = %spec.name, error = %e, "stop failed");
            }
            // kill_on_drop backstops anything the graceful stop missed
            self.tunnels.remove(&spec.name);
        }

        info!("all units stopped");
    }

    /// Reap exited children we own so the process table reflects reality.
    fn reap(&mut self) {
        let mut exited = Vec::new();
        for (name, child) in self.children.iter_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                info!(unit = %name, %status, "service exited");
                exited.push(name.clone());
            }
        }
        for name in exited {
            self.children.remove(&name);
        }

        let mut gone = Vec::new();
        for (name, handle) in self.tunnels.iter_mut() {
            if handle.has_exited() {
                info!(unit = %name, "tunnel client exited");
                gone.push(name.clone());
            }
        }
        for name in gone {
            self.tunnels.remove(&name);
        }
    }

    /// Probe every configured unit concurrently (independent read-only
    /// checks).
    async fn probe_all(&self) -> HashMap<String, Liveness> {
        let mut records = Vec::new();
        for unit in self.config.units() {
            let record = self.store.load(&unit.name).ok().flatten();
            records.push((unit.name, record));
        }

        let probes = records.into_iter().map(|(name, record)| async move {
            let liveness = record
                .as_ref()
                .map(probe_record)
                .unwrap_or(Liveness::Dead);
            (name, liveness)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Mark a dead unit's record. Crashes become `failed`; deliberate
    /// stops stay `stopped`.
    fn mark_dead(&self, name: &str) -> Result<(), SupervisorError> {
        if let Some(record) = self.store.load(name)? {
            if record.pid.is_some() {
                warn!(unit = %name, pid = ?record.pid, "process died");
                self.store.clear_pid(name, UnitStatus::Failed)?;
            }
        }
        Ok(())
    }

    /// Whether the loop should bring this dead unit back.
    fn should_restart(&self, name: &str, policy: RestartPolicy) -> bool {
        if policy == RestartPolicy::Never {
            return false;
        }
        match self.store.load(name) {
            // A unit stopped on purpose stays down until asked back up
            Ok(Some(record)) => record.status != UnitStatus::Stopped,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Stop any recorded process that survived a previous supervisor run,
    /// so bring-up never duplicates a unit.
    async fn sweep_stale(&mut self) -> Result<(), SupervisorError> {
        for record in self.store.list()? {
            if probe_record(&record) == Liveness::Alive {
                info!(unit = %record.name, pid = ?record.pid, "stopping stale process from a previous run");
                let launcher = Launcher::new(&self.config, &self.store);
                launcher.stop_unit(&record.name).await?;
            }
        }
        Ok(())
    }

    /// Start (or restart) a tunnel and discover its public URL.
    async fn start_tunnel(&mut self, spec: &TunnelSpec) -> Result<(), SupervisorError> {
        // Idempotent: an alive process under this name is left alone
        if let Some(record) = self.store.load(&spec.name)? {
            if probe_record(&record) == Liveness::Alive {
                return Ok(());
            }
        }

        let previous_url = self
            .store
            .load(&spec.name)?
            .and_then(|record| record.public_url);

        let mut record = UnitRecord::new(&spec.name, spawn_args(spec.provider, spec.local_port));
        // Keep the last-known URL so dependent restarts never block on a
        // transiently down tunnel
        record.public_url = previous_url.clone();
        record.status = UnitStatus::Starting;
        self.store.save(&record)?;

        let provider = provider_for(spec.provider);
        let mut handle = match provider.spawn(spec.local_port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.store.set_status(&spec.name, UnitStatus::Failed)?;
                return Err(tunnel_error(&spec.name, e));
            }
        };
        record.pid = handle.pid();
        self.store.save(&record)?;

        let discovered = provider
            .discover(&mut handle, self.config.discovery_timeout())
            .await;

        match discovered {
            Ok(url) => {
                let normalized = normalize_url(&url, spec.scheme);
                let changed = previous_url.as_deref() != Some(normalized.as_str());
                record.public_url = Some(normalized.to_string());
                record.status = UnitStatus::Running;
                self.store.save(&record)?;
                self.tunnels.insert(spec.name.clone(), handle);

                info!(unit = %spec.name, url = %normalized, "tunnel up");
                if changed && spec.scheme == BindingScheme::Webhook {
                    self.register_webhook(&url);
                }
                Ok(())
            }
            Err(TunnelError::DiscoveryTimeout { timeout, .. }) => {
                // The client is up; keep it and retry discovery next tick
                record.status = if record.public_url.is_some() {
                    UnitStatus::Running
                } else {
                    UnitStatus::Degraded
                };
                self.store.save(&record)?;
                self.tunnels.insert(spec.name.clone(), handle);

                Err(SupervisorError::UrlDiscoveryTimeout {
                    unit: spec.name.clone(),
                    timeout,
                })
            }
            Err(e) => {
                self.store.set_status(&spec.name, UnitStatus::Failed)?;
                Err(tunnel_error(&spec.name, e))
            }
        }
    }

    /// Retry URL discovery for an alive tunnel that has no resolved URL yet.
    async fn rediscover_if_unresolved(&mut self, spec: &TunnelSpec) {
        let unresolved = matches!(
            self.store.load(&spec.name),
            Ok(Some(UnitRecord {
                public_url: None,
                ..
            }))
        );
        if !unresolved {
            return;
        }

        let provider = provider_for(spec.provider);
        let discovered = {
            let Some(handle) = self.tunnels.get_mut(&spec.name) else {
                // Not ours to introspect (externally started); leave it
                return;
            };
            provider
                .discover(handle, self.config.discovery_timeout())
                .await
        };

        match discovered {
            Ok(url) => {
                let normalized = normalize_url(&url, spec.scheme);
                if let Ok(Some(mut record)) = self.store.load(&spec.name) {
                    record.public_url = Some(normalized.to_string());
                    record.status = UnitStatus::Running;
                    if let Err(e) = self.store.save(&record) {
                        warn!(unit = %spec.name, error = %e, "failed to persist discovered URL");
                        return;
                    }
                }
                info!(unit = %spec.name, url = %normalized, "public URL discovered");
                if spec.scheme == BindingScheme::Webhook {
                    self.register_webhook(&url);
                }
            }
            Err(e) => {
                warn!(unit = %spec.name, error = %e, "URL still unresolved, retrying next tick");
            }
        }
    }

    /// Start a service with the currently resolved URLs injected.
    async fn start_service(&mut self, spec: &ServiceSpec) -> Result<(), SupervisorError> {
        let (record, child) = {
            let launcher = Launcher::new(&self.config, &self.store);
            let urls = launcher.resolved_urls(spec)?;
            launcher.start_service(spec, &urls).await?
        };
        if let Some(child) = child {
            self.children.insert(spec.name.clone(), child);
        }
        if record.status == UnitStatus::Degraded {
            warn!(unit = %spec.name, "running on local fallback URL until the tunnel resolves");
        }
        Ok(())
    }

    /// Stop and relaunch a service (URLs are injected at start time only).
    /// The record reads `starting` for the whole restart window, so a
    /// concurrent `status` never observes a fleeting `running` or `stopped`.
    async fn restart_service(&mut self, spec: &ServiceSpec) -> Result<(), SupervisorError> {
        let record = self.store.load(&spec.name)?;
        self.store.set_status(&spec.name, UnitStatus::Starting)?;

        if let Some(record) = &record {
            if let Some(pid) = record.pid {
                if probe_record(record) == Liveness::Alive {
                    crate::launcher::stop_pid(pid, self.config.grace_period()).await;
                }
            }
        }
        self.store.clear_pid(&spec.name, UnitStatus::Starting)?;

        if let Some(mut child) = self.children.remove(&spec.name) {
            let _ = child.wait().await;
        }
        self.start_service(spec).await
    }

    /// Whether a running service was launched with URLs that no longer
    /// match the resolved ones. Fallback downgrades never count: a live
    /// service is not restarted just because its tunnel is momentarily
    /// down.
    fn url_drift(&self, spec: &ServiceSpec) -> Result<bool, SupervisorError> {
        let Some(record) = self.store.load(&spec.name)? else {
            return Ok(false);
        };
        let launcher = Launcher::new(&self.config, &self.store);
        let desired = launcher.resolved_urls(spec)?;
        Ok(desired.iter().any(|(key, resolved)| {
            !resolved.fallback && record.env_urls.get(key) != Some(&resolved.url)
        }))
    }

    /// Fire-and-forget webhook registration with the phone provider.
    fn register_webhook(&self, public_url: &Url) {
        let Some(creds) = self.config.twilio.clone() else {
            info!("no phone provider credentials configured, skipping webhook registration");
            return;
        };
        let url = public_url.clone();
        tokio::spawn(async move {
            twilio::register_voice_webhook(&creds.expanded(), &url).await;
        });
    }

    /// Summarize what came up, the way operators expect after `start`.
    fn log_banner(&self) -> Result<(), SupervisorError> {
        for record in self.store.list()? {
            match record.public_url {
                Some(url) => {
                    info!(unit = %record.name, pid = ?record.pid, status = %record.status, %url, "up")
                }
                None => {
                    info!(unit = %record.name, pid = ?record.pid, status = %record.status, "up")
                }
            }
        }
        Ok(())
    }
}

fn tunnel_error(unit: &str, e: TunnelError) -> SupervisorError {
    match e {
        TunnelError::ProviderUnavailable { provider, reason } => {
            SupervisorError::ProviderUnavailable { provider, reason }
        }
        TunnelError::DiscoveryTimeout { timeout, .. } => SupervisorError::UrlDiscoveryTimeout {
            unit: unit.to_string(),
            timeout,
        },
        TunnelError::Io(e) => SupervisorError::Store(e),
        other => SupervisorError::ProviderUnavailable {
            provider: unit.to_string(),
            reason: other.to_string(),
        },
    }
}
