//! Configuration save workflow
//!
//! Pushes every pending edit of a device's change registry to the radio,
//! commits the edit session and folds the edits into confirmed state.
//! Individual send failures are collected instead of aborting the save.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meshsync_core::{
    events::{ConfigSection, ModuleConfigSection},
    Channel, ChangeKey, DeviceLink, DeviceRecord,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Report Types
// ----------------------------------------------------------------------------

/// Save phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SavePhase {
    Channels,
    Configs,
    Modules,
    Admin,
    Commit,
    Finalizing,
}

impl fmt::Display for SavePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SavePhase::Channels => "channels",
            SavePhase::Configs => "configs",
            SavePhase::Modules => "modules",
            SavePhase::Admin => "admin",
            SavePhase::Commit => "commit",
            SavePhase::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Sends completed out of sends attempted in one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseProgress {
    pub done: usize,
    pub total: usize,
}

/// One send that the device did not accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFailure {
    pub kind: SavePhase,
    /// Serialized change key of the failed edit
    pub key: String,
    pub error: String,
}

/// Outcome of a completed save
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub channels: PhaseProgress,
    pub configs: PhaseProgress,
    pub modules: PhaseProgress,
    pub admin: PhaseProgress,
    /// Whether the edit session was committed on the device
    pub committed: bool,
    pub failures: Vec<SaveFailure>,
}

impl SaveReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    fn progress_mut(&mut self, phase: SavePhase) -> Option<&mut PhaseProgress> {
        match phase {
            SavePhase::Channels => Some(&mut self.channels),
            SavePhase::Configs => Some(&mut self.configs),
            SavePhase::Modules => Some(&mut self.modules),
            SavePhase::Admin => Some(&mut self.admin),
            SavePhase::Commit | SavePhase::Finalizing => None,
        }
    }

    fn record(&mut self, phase: SavePhase, key: &ChangeKey, outcome: meshsync_core::Result<()>) {
        let failure = outcome.err().map(|err| SaveFailure {
            kind: phase,
            key: key.serialize_key(),
            error: err.to_string(),
        });
        if let Some(progress) = self.progress_mut(phase) {
            progress.total += 1;
            if failure.is_none() {
                progress.done += 1;
            }
        }
        if let Some(failure) = failure {
            warn!("Save {} failed for {}: {}", phase, failure.key, failure.error);
            self.failures.push(failure);
        }
    }
}

/// Reasons a save could not start
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    #[error("A save is already in progress")]
    AlreadySaving,
    #[error("No active device connection")]
    NotConnected,
}

// ----------------------------------------------------------------------------
// Save Workflow
// ----------------------------------------------------------------------------

/// Runs saves one at a time
#[derive(Debug, Clone, Default)]
pub struct SaveWorkflow {
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag however the save ends
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SaveWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Push the pending edits of `device` through `link`
    pub async fn run(
        &self,
        link: &dyn DeviceLink,
        device: &mut DeviceRecord,
    ) -> Result<SaveReport, SaveError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SaveError::AlreadySaving);
        }
        let _guard = InFlightGuard(self.in_flight.clone());

        let registry = device.change_registry();
        let channels = collect_channels(registry.get_all_channel_changes());
        // Sections go out merged over confirmed state, the same value
        // `apply_pending_changes` commits locally
        let configs: Vec<ConfigSection> = registry
            .get_all_config_changes()
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .filter_map(|(variant, _)| {
                device
                    .get_effective_config(variant)
                    .map(|value| ConfigSection { variant, value })
            })
            .collect();
        let modules: Vec<ModuleConfigSection> = registry
            .get_all_module_config_changes()
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .filter_map(|(variant, _)| {
                device
                    .get_effective_module_config(variant)
                    .map(|value| ModuleConfigSection { variant, value })
            })
            .collect();
        let admin = registry.get_all_queued_admin_messages();

        info!(
            "Saving device {}: {} channel(s), {} config(s), {} module(s), {} admin message(s)",
            device.id(),
            channels.len(),
            configs.len(),
            modules.len(),
            admin.len()
        );

        let mut report = SaveReport::default();

        for channel in &channels {
            let key = ChangeKey::Channel(channel.index);
            report.record(SavePhase::Channels, &key, link.set_channel(channel).await);
        }
        for section in &configs {
            let key = ChangeKey::Config(section.variant);
            report.record(SavePhase::Configs, &key, link.set_config(section).await);
        }
        for section in &modules {
            let key = ChangeKey::ModuleConfig(section.variant);
            report.record(SavePhase::Modules, &key, link.set_module_config(section).await);
        }
        for (key, action) in &admin {
            report.record(SavePhase::Admin, key, link.send_admin(action).await);
        }

        let sent_settings = report.configs.total + report.modules.total;
        let accepted_settings = report.configs.done + report.modules.done;
        if sent_settings > 0 && accepted_settings > 0 {
            match link.commit_edit_settings().await {
                Ok(()) => report.committed = true,
                Err(err) => {
                    warn!("Commit of edited settings failed: {}", err);
                    report.failures.push(SaveFailure {
                        kind: SavePhase::Commit,
                        key: "commit".to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        debug!("Save {} for device {}", SavePhase::Finalizing, device.id());
        device.apply_pending_changes();
        device.change_registry_mut().clear_all_changes();

        if report.is_partial() {
            warn!(
                "Save of device {} finished with {} failure(s)",
                device.id(),
                report.failures.len()
            );
        } else {
            info!("Save of device {} complete", device.id());
        }
        Ok(report)
    }
}

fn collect_channels(pending: Vec<(u8, &Value)>) -> Vec<Channel> {
    pending
        .into_iter()
        .filter_map(|(index, value)| match serde_json::from_value::<Channel>(value.clone()) {
            Ok(channel) => Some(Channel { index, ..channel }),
            Err(err) => {
                warn!("Skipping pending channel {}: {}", index, err);
                None
            }
        })
        .collect()
}
