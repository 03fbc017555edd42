//! The supervisor
//!
//! Boots a pool of worker processes sharing one port, watches the config
//! file, and performs rolling stop-then-start reloads: validate the new
//! document first, then replace workers one at a time. The first
//! replacement that fails to come up aborts the reload — workers not yet
//! recycled keep serving with the old config, and the torn-down slot is
//! respawned.

mod watcher;
pub(crate) mod worker;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{parse_config, Config, Settings};

use worker::WorkerHandle;

/// Spacing between serial worker spawns at boot. Port reuse semantics only
/// settle once the first binder is live on some platforms.
const BOOT_SPACING: Duration = Duration::from_millis(100);

/// One pool slot; `None` while the slot's worker is down.
struct WorkerSlot {
    id: usize,
    handle: Option<WorkerHandle>,
}

pub struct Supervisor {
    port: u16,
    config_path: PathBuf,
    config: Config,
    /// Raw text of the active document. Workers read their config from disk
    /// at spawn, and a reload overwrites that file before any worker is
    /// recycled — this copy is what a rollback restores from.
    active_raw: Option<String>,
    slots: Vec<WorkerSlot>,
    reloading: bool,
}

impl Supervisor {
    pub fn new(config: Config, settings: &Settings) -> Self {
        let slots = (0..settings.worker_count)
            .map(|id| WorkerSlot { id, handle: None })
            .collect();
        Self {
            port: settings.port,
            config_path: settings.config_path.clone(),
            config,
            active_raw: None,
            slots,
            reloading: false,
        }
    }

    /// Boot the pool, then serve reloads and signals until shutdown.
    pub async fn run(mut self) -> Result<()> {
        self.boot().await?;

        let (mut reload_rx, _watcher) = watcher::watch(self.config_path.clone())
            .context("failed to start config watcher")?;

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                trigger = reload_rx.recv() => {
                    if trigger.is_none() {
                        tracing::warn!("config watcher closed");
                        continue;
                    }
                    self.rolling_reload().await;
                }
            }
        }

        self.shutdown_all().await;
        Ok(())
    }

    /// Spawn the pool serially with a small delay between binds.
    async fn boot(&mut self) -> Result<()> {
        // The document was validated before the supervisor was built; keep
        // its text for rollbacks.
        self.active_raw = std::fs::read_to_string(&self.config_path).ok();

        let total = self.slots.len();
        tracing::info!(
            workers = total,
            port = self.port,
            routes = self.config.routes.len(),
            "booting worker pool"
        );

        for index in 0..total {
            let id = self.slots[index].id;
            match WorkerHandle::spawn(id, self.port, &self.config_path).await {
                Ok(handle) => self.slots[index].handle = Some(handle),
                Err(e) => {
                    // Boot does not retry failed workers; the rest of the
                    // pool still comes up.
                    tracing::error!(worker = id, error = %e, "worker failed to boot");
                }
            }
            if index + 1 < total {
                tokio::time::sleep(BOOT_SPACING).await;
            }
        }

        if self.slots.iter().all(|slot| slot.handle.is_none()) {
            anyhow::bail!("no worker became ready");
        }
        Ok(())
    }

    /// Validate the edited config, then recycle workers one at a time.
    async fn rolling_reload(&mut self) {
        if self.reloading {
            tracing::warn!("reload already in progress, ignoring trigger");
            return;
        }
        self.reloading = true;
        self.do_rolling_reload().await;
        self.reloading = false;
    }

    async fn do_rolling_reload(&mut self) {
        let raw = match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "reload aborted: cannot read config, keeping current config");
                return;
            }
        };
        let new_config = match parse_config(&raw, &self.config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "reload aborted: new config is invalid, keeping current config");
                return;
            }
        };

        tracing::info!("config change validated, starting rolling reload");

        for index in 0..self.slots.len() {
            let id = self.slots[index].id;
            let Some(old) = self.slots[index].handle.take() else {
                continue;
            };

            old.shutdown().await;

            match WorkerHandle::spawn(id, self.port, &self.config_path).await {
                Ok(handle) => {
                    self.slots[index].handle = Some(handle);
                    tracing::info!(worker = id, "worker recycled");
                }
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "replacement worker failed, aborting reload");
                    // Restore the slot we tore down on the config it was
                    // running; workers not yet recycled were never touched.
                    self.restore_slot(index).await;
                    tracing::error!("rolling reload failed");
                    return;
                }
            }
        }

        self.config = new_config;
        self.active_raw = Some(raw);
        tracing::info!("rolling reload complete");
    }

    /// Respawn a torn-down slot on the previous config.
    ///
    /// The on-disk document already holds the new config the failed
    /// replacement was started from, and workers read their config from
    /// disk at spawn — so the previous document is written to a snapshot
    /// file and the restored worker is pointed at that instead. Without a
    /// snapshot the slot stays down rather than quietly joining the pool
    /// on the wrong config.
    async fn restore_slot(&mut self, index: usize) {
        let id = self.slots[index].id;

        let Some(snapshot) = self.write_rollback_snapshot() else {
            tracing::error!(
                worker = id,
                "no snapshot of the previous config; slot stays down to keep the pool consistent"
            );
            return;
        };

        match WorkerHandle::spawn(id, self.port, &snapshot).await {
            Ok(handle) => {
                self.slots[index].handle = Some(handle);
                tracing::warn!(worker = id, "torn-down worker restored on previous config");
            }
            Err(e) => {
                tracing::error!(worker = id, error = %e, "failed to restore worker; slot stays down");
            }
        }
    }

    /// Write the active document to the rollback snapshot file.
    fn write_rollback_snapshot(&self) -> Option<PathBuf> {
        let raw = self.active_raw.as_deref()?;
        let path = std::env::temp_dir().join(format!("bungee-rollback-{}.json", std::process::id()));
        match std::fs::write(&path, raw) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to write config snapshot");
                None
            }
        }
    }

    /// Shut every worker down in parallel, bounded by the per-worker
    /// shutdown timeout.
    async fn shutdown_all(&mut self) {
        let handles: Vec<WorkerHandle> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.handle.take())
            .collect();

        futures::future::join_all(handles.into_iter().map(|handle| handle.shutdown())).await;
        tracing::info!("all workers stopped");
    }
}
