//! Live device seam.
//!
//! A [`Device`] is the running instance of a patch: ranged parameters the
//! router writes, an outport [`MessageEvent`] it reads, and an [`AudioNode`]
//! that [`AudioOutput`] connects to the destination. The DSP runtime itself
//! lives behind [`DeviceFactory`].

mod description;
mod message;

pub use description::{OutportSpec, ParameterSpec, PatchDescription};
pub use message::{MessageEvent, MessageFilter, MessagePayload, OutportMessage, Subscription};

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

use crate::persistence::ApiError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("malformed patch description: {0}")]
    MalformedDescription(String),
    #[error("patch was exported with debug runtime version {0}")]
    DebugExport(String),
    #[error("no patch exists for `{0}`")]
    PatchNotFound(String),
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("audio output already has device #{0} connected")]
    OutputBusy(u64),
    #[error("device construction failed: {0}")]
    Construction(String),
    #[error("device setup was cancelled")]
    Cancelled,
    #[error("fetching patch description failed: {0}")]
    Fetch(#[from] ApiError),
}

/// Ranged control on a live device. Writes are clamped into `[min, max]`.
#[derive(Debug)]
pub struct Parameter {
    spec: ParameterSpec,
    bits: AtomicU64,
}

impl Parameter {
    pub fn new(mut spec: ParameterSpec) -> Self {
        if spec.min > spec.max {
            std::mem::swap(&mut spec.min, &mut spec.max);
        }
        let initial = spec.initial.unwrap_or(spec.min).max(spec.min).min(spec.max);
        Self {
            bits: AtomicU64::new(initial.to_bits()),
            spec,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn min(&self) -> f64 {
        self.spec.min
    }

    pub fn max(&self) -> f64 {
        self.spec.max
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Write `value`, clamped. NaN writes the minimum. Returns the stored value.
    pub fn set_value(&self, value: f64) -> f64 {
        let clamped = if value.is_nan() {
            self.spec.min
        } else {
            value.max(self.spec.min).min(self.spec.max)
        };
        self.bits.store(clamped.to_bits(), Ordering::Release);
        clamped
    }

    pub fn normalized(&self) -> f64 {
        let span = self.spec.max - self.spec.min;
        if span == 0.0 {
            0.0
        } else {
            (self.value() - self.spec.min) / span
        }
    }

    /// Map `normalized` from `[0, 1]` linearly onto `[min, max]` and write it.
    pub fn set_normalized(&self, normalized: f64) -> f64 {
        let n = if normalized.is_nan() {
            0.0
        } else {
            normalized.clamp(0.0, 1.0)
        };
        self.set_value(self.spec.min + n * (self.spec.max - self.spec.min))
    }
}

/// Audio graph endpoint of a device.
pub trait AudioNode: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
}

/// Node that only remembers whether it is connected.
#[derive(Debug, Default)]
pub struct NullAudioNode {
    connected: AtomicBool,
}

impl NullAudioNode {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl AudioNode for NullAudioNode {
    fn connect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

pub struct Device {
    instance_id: u64,
    patch_id: String,
    parameters: Vec<Arc<Parameter>>,
    outports: Vec<String>,
    messages: MessageEvent,
    node: Arc<dyn AudioNode>,
}

impl Device {
    pub fn new(
        instance_id: u64,
        patch_id: impl Into<String>,
        description: &PatchDescription,
        node: Arc<dyn AudioNode>,
    ) -> Self {
        Self {
            instance_id,
            patch_id: patch_id.into(),
            parameters: description
                .parameters
                .iter()
                .cloned()
                .map(|spec| Arc::new(Parameter::new(spec)))
                .collect(),
            outports: description.outports.iter().map(|p| p.tag.clone()).collect(),
            messages: MessageEvent::new(),
            node,
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn patch_id(&self) -> &str {
        &self.patch_id
    }

    pub fn parameters(&self) -> &[Arc<Parameter>] {
        &self.parameters
    }

    pub fn parameter(&self, id: &str) -> Option<Arc<Parameter>> {
        self.parameters.iter().find(|p| p.id() == id).cloned()
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<Arc<Parameter>> {
        self.parameters.iter().find(|p| p.name() == name).cloned()
    }

    pub fn outports(&self) -> &[String] {
        &self.outports
    }

    pub fn messages(&self) -> &MessageEvent {
        &self.messages
    }

    /// Emit an outport message as the running patch would.
    pub fn emit(&self, message: OutportMessage) -> usize {
        self.messages.emit(&message)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("instance_id", &self.instance_id)
            .field("patch_id", &self.patch_id)
            .field("parameters", &self.parameters.len())
            .field("outports", &self.outports)
            .finish()
    }
}

/// Destination output. At most one device is connected at a time.
#[derive(Debug, Default)]
pub struct AudioOutput {
    active: Option<u64>,
}

impl AudioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, device: &Device) -> Result<(), DeviceError> {
        match self.active {
            Some(id) if id == device.instance_id => Ok(()),
            Some(id) => Err(DeviceError::OutputBusy(id)),
            None => {
                device.node.connect();
                self.active = Some(device.instance_id);
                Ok(())
            }
        }
    }

    /// Disconnect `device` if it is the active one.
    pub fn disconnect(&mut self, device: &Device) -> bool {
        if self.active == Some(device.instance_id) {
            device.node.disconnect();
            self.active = None;
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> Option<u64> {
        self.active
    }
}

/// Builds live devices from patch descriptions.
pub trait DeviceFactory: Send + Sync {
    fn create_device(
        &self,
        patch_id: &str,
        description: PatchDescription,
    ) -> impl Future<Output = Result<Device, DeviceError>> + Send;
}

/// Factory producing devices with [`NullAudioNode`]s. Useful for hosts
/// without an audio runtime and for tests.
#[derive(Debug, Default)]
pub struct HeadlessDeviceFactory {
    next_id: AtomicU64,
}

impl HeadlessDeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&self, patch_id: &str, description: &PatchDescription) -> Device {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Device::new(id, patch_id, description, Arc::new(NullAudioNode::default()))
    }
}

impl DeviceFactory for HeadlessDeviceFactory {
    async fn create_device(
        &self,
        patch_id: &str,
        description: PatchDescription,
    ) -> Result<Device, DeviceError> {
        Ok(self.build(patch_id, &description))
    }
}
