//! Patch description parsing.
//!
//! Only the parts the editor needs are interpreted: the parameter list, the
//! outport tags, and the exporter version. The full document is kept so a
//! [`DeviceFactory`](super::DeviceFactory) can hand it to the audio runtime.

use serde::Deserialize;
use serde_json::Value;

use super::DeviceError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterSpec {
    #[serde(alias = "paramId")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "minimum", default)]
    pub min: f64,
    #[serde(alias = "maximum", default = "default_max")]
    pub max: f64,
    #[serde(alias = "initialValue", default)]
    pub initial: Option<f64>,
}

fn default_max() -> f64 {
    1.0
}

impl ParameterSpec {
    pub fn new(id: impl Into<String>, min: f64, max: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            min,
            max,
            initial: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_initial(mut self, value: f64) -> Self {
        self.initial = Some(value);
        self
    }

    fn validate(mut self) -> Result<Self, DeviceError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(DeviceError::MalformedDescription(format!(
                "parameter `{}` has a non-finite range",
                self.id
            )));
        }
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutportSpec {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
struct RawDesc {
    #[serde(default)]
    parameters: Vec<ParameterSpec>,
    #[serde(default)]
    outports: Vec<OutportSpec>,
    #[serde(default)]
    meta: RawMeta,
}

#[derive(Debug, Default, Deserialize)]
struct RawMeta {
    #[serde(default)]
    rnboversion: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchDescription {
    pub parameters: Vec<ParameterSpec>,
    pub outports: Vec<OutportSpec>,
    pub exporter_version: Option<String>,
    pub document: Value,
}

impl PatchDescription {
    pub fn new(parameters: Vec<ParameterSpec>, outports: Vec<OutportSpec>) -> Self {
        Self {
            parameters,
            outports,
            exporter_version: None,
            document: Value::Null,
        }
    }

    /// Parse an exported patch document. A missing `desc` object, or a debug
    /// build of the exporter, aborts before anything is constructed.
    pub fn from_json(document: Value) -> Result<Self, DeviceError> {
        let desc = document
            .get("desc")
            .filter(|desc| desc.is_object())
            .ok_or_else(|| DeviceError::MalformedDescription("missing `desc` object".into()))?;
        let raw = RawDesc::deserialize(desc)
            .map_err(|err| DeviceError::MalformedDescription(err.to_string()))?;

        if let Some(version) = raw.meta.rnboversion.as_deref() {
            if is_debug_version(version) {
                return Err(DeviceError::DebugExport(version.to_string()));
            }
        }

        let parameters = raw
            .parameters
            .into_iter()
            .map(ParameterSpec::validate)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            parameters,
            outports: raw.outports,
            exporter_version: raw.meta.rnboversion,
            document,
        })
    }

    pub fn parameter(&self, id: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|param| param.id == id)
    }

    pub fn has_outport(&self, tag: &str) -> bool {
        self.outports.iter().any(|port| port.tag == tag)
    }
}

/// `major.minor.patch-dev`
fn is_debug_version(version: &str) -> bool {
    let Some(core) = version.strip_suffix("-dev") else {
        return false;
    };
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}
