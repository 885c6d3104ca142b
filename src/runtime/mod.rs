use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use crate::layout::model::{DEFAULT_COLUMNS, clamp_columns};
use crate::logging::{LogLevel, Logger, METRICS_TARGET};
use crate::metrics::SessionMetrics;
use crate::{PatchGridError, Result};

pub mod audit;
mod session;

pub use session::{
    DeviceSetup, EditorSession, LayoutLoad, LayoutSave, LayoutTicket, LoadOutcome, LoadedPatch,
    SaveOutcome, SessionTick, SetupOutcome, SetupTicket, random_seed_value,
};

use self::audit::{NullSessionAudit, SessionAudit};

/// File-loadable session knobs. Every field has a default, so `{}` is a
/// valid settings document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub default_columns: u8,
    pub reflow_debounce_ms: u64,
    pub button_reset_ms: u64,
    pub metrics_interval_ms: u64,
    pub randomize_seed: bool,
    pub seed_parameter: String,
    /// Container width assumed until the host reports one.
    pub container_width: f32,
    /// Events below this level are not written.
    pub log_level: LogLevel,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_columns: DEFAULT_COLUMNS,
            reflow_debounce_ms: 300,
            button_reset_ms: 40,
            metrics_interval_ms: 5000,
            randomize_seed: true,
            seed_parameter: "randomSeed".to_string(),
            container_width: 1280.0,
            log_level: LogLevel::Debug,
        }
    }
}

impl SessionSettings {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut settings: Self = serde_json::from_str(raw)?;
        settings.default_columns = clamp_columns(settings.default_columns as i64);
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn reflow_debounce(&self) -> Duration {
        Duration::from_millis(self.reflow_debounce_ms)
    }

    pub fn button_reset(&self) -> Duration {
        Duration::from_millis(self.button_reset_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Runtime wiring for an [`EditorSession`].
#[derive(Clone)]
pub struct SessionConfig {
    pub settings: SessionSettings,
    /// Optional structured logger used by the session, grid and router.
    pub logger: Option<Logger>,
    /// Metrics accumulator used for periodic snapshots.
    pub metrics: Option<Arc<Mutex<SessionMetrics>>>,
    /// Target field used when emitting metrics snapshots.
    pub metrics_target: String,
    pub audit: Arc<dyn SessionAudit>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settings: SessionSettings::default(),
            logger: None,
            metrics: None,
            metrics_target: METRICS_TARGET.to_string(),
            audit: Arc::new(NullSessionAudit),
        }
    }
}

impl SessionConfig {
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn SessionAudit>) -> Self {
        self.audit = audit;
        self
    }

    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(SessionMetrics::new())));
        }
    }

    /// Disable metrics collection and prevent further snapshots.
    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    /// Access the shared metrics handle if metrics are enabled.
    pub fn metrics_handle(&self) -> Option<Arc<Mutex<SessionMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("settings", &self.settings)
            .field("logger", &self.logger.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("metrics_target", &self.metrics_target)
            .finish_non_exhaustive()
    }
}

/// Whether audio may start, and whether a device is connected.
///
/// Playback cannot begin before the user has interacted with the page, so
/// device setup is refused while `NotReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioReadiness {
    #[default]
    NotReady,
    ReadyNoDevice,
    ReadyWithDevice,
}

impl AudioReadiness {
    pub fn first_gesture(self) -> Self {
        match self {
            AudioReadiness::NotReady => AudioReadiness::ReadyNoDevice,
            other => other,
        }
    }

    pub fn device_connected(self) -> Result<Self> {
        match self {
            AudioReadiness::NotReady => Err(PatchGridError::NoDevice),
            _ => Ok(AudioReadiness::ReadyWithDevice),
        }
    }

    pub fn device_torn_down(self) -> Self {
        match self {
            AudioReadiness::ReadyWithDevice => AudioReadiness::ReadyNoDevice,
            other => other,
        }
    }

    pub fn can_start_audio(self) -> bool {
        self != AudioReadiness::NotReady
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotificationLevel {
    Info,
    Warning,
    Alert,
}

/// User-visible outcome of a session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    LayoutSaved { patch_id: String },
    SaveFailed { patch_id: String, message: String },
    LoadFailed { patch_id: String, message: String },
    DeviceSetupFailed { patch_id: String, message: String },
}

impl Notification {
    pub fn level(&self) -> NotificationLevel {
        match self {
            Notification::LayoutSaved { .. } => NotificationLevel::Info,
            Notification::SaveFailed { .. } | Notification::LoadFailed { .. } => {
                NotificationLevel::Warning
            }
            Notification::DeviceSetupFailed { .. } => NotificationLevel::Alert,
        }
    }

    pub fn patch_id(&self) -> &str {
        match self {
            Notification::LayoutSaved { patch_id }
            | Notification::SaveFailed { patch_id, .. }
            | Notification::LoadFailed { patch_id, .. }
            | Notification::DeviceSetupFailed { patch_id, .. } => patch_id,
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::LayoutSaved { .. } => f.write_str("Layout saved"),
            Notification::SaveFailed { message, .. } => {
                write!(f, "Saving the layout failed: {message}")
            }
            Notification::LoadFailed { message, .. } => {
                write!(f, "Loading the layout failed: {message}")
            }
            Notification::DeviceSetupFailed { message, .. } => {
                write!(f, "This patch could not be started: {message}")
            }
        }
    }
}
