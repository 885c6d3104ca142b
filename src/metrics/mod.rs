use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    display_updates: u64,
    display_unchanged: u64,
    parameter_writes: u64,
    reflows: u64,
    layouts_applied: u64,
    stale_loads_discarded: u64,
    saves_ok: u64,
    saves_failed: u64,
    devices_connected: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One outport message delivered to a bound widget.
    pub fn record_display_update(&mut self, changed: bool) {
        if changed {
            self.display_updates = self.display_updates.saturating_add(1);
        } else {
            self.display_unchanged = self.display_unchanged.saturating_add(1);
        }
    }

    pub fn record_parameter_write(&mut self) {
        self.parameter_writes = self.parameter_writes.saturating_add(1);
    }

    pub fn record_reflow(&mut self) {
        self.reflows = self.reflows.saturating_add(1);
    }

    pub fn record_layout_applied(&mut self) {
        self.layouts_applied = self.layouts_applied.saturating_add(1);
    }

    pub fn record_stale_load(&mut self) {
        self.stale_loads_discarded = self.stale_loads_discarded.saturating_add(1);
    }

    pub fn record_save(&mut self, ok: bool) {
        if ok {
            self.saves_ok = self.saves_ok.saturating_add(1);
        } else {
            self.saves_failed = self.saves_failed.saturating_add(1);
        }
    }

    pub fn record_device_connected(&mut self) {
        self.devices_connected = self.devices_connected.saturating_add(1);
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            display_updates: self.display_updates,
            display_unchanged: self.display_unchanged,
            parameter_writes: self.parameter_writes,
            reflows: self.reflows,
            layouts_applied: self.layouts_applied,
            stale_loads_discarded: self.stale_loads_discarded,
            saves_ok: self.saves_ok,
            saves_failed: self.saves_failed,
            devices_connected: self.devices_connected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub display_updates: u64,
    pub display_unchanged: u64,
    pub parameter_writes: u64,
    pub reflows: u64,
    pub layouts_applied: u64,
    pub stale_loads_discarded: u64,
    pub saves_ok: u64,
    pub saves_failed: u64,
    pub devices_connected: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent {
            fields: self.as_fields(),
            ..LogEvent::new(LogLevel::Info, target, "session_metrics")
        }
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("display_updates".to_string(), json!(self.display_updates));
        map.insert("display_unchanged".to_string(), json!(self.display_unchanged));
        map.insert("parameter_writes".to_string(), json!(self.parameter_writes));
        map.insert("reflows".to_string(), json!(self.reflows));
        map.insert("layouts_applied".to_string(), json!(self.layouts_applied));
        map.insert(
            "stale_loads_discarded".to_string(),
            json!(self.stale_loads_discarded),
        );
        map.insert("saves_ok".to_string(), json!(self.saves_ok));
        map.insert("saves_failed".to_string(), json!(self.saves_failed));
        map.insert("devices_connected".to_string(), json!(self.devices_connected));
        map
    }
}
