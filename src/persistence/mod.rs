//! Layout persistence client.
//!
//! [`LayoutApi`] is the seam to the external API. A missing layout is an
//! expected outcome (`Ok(None)`), not an error. Saves replace the stored
//! layout wholesale.

mod http;
mod memory;

pub use http::HttpLayoutApi;
pub use memory::MemoryLayoutApi;

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::layout::model::{Layout, LayoutEntry, ParsedEntries, clamp_columns, parse_entries};
use crate::resolver::UiAssociations;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Body of `GET /getLayout/{patchId}`. Every field may be absent on patches
/// that predate layouts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutDocument {
    #[serde(default)]
    pub layout: Option<Vec<Value>>,
    #[serde(rename = "numColumns", default)]
    pub num_columns: Option<i64>,
    #[serde(rename = "showLabels", default)]
    pub show_labels: Option<bool>,
}

impl LayoutDocument {
    pub fn from_layout(layout: &Layout) -> Result<Self, serde_json::Error> {
        Ok(Self {
            layout: Some(
                layout
                    .entries
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            num_columns: Some(layout.num_columns as i64),
            show_labels: Some(layout.show_labels),
        })
    }

    pub fn decode(&self) -> LoadedLayout {
        LoadedLayout {
            parsed: parse_entries(self.layout.as_deref().unwrap_or_default()),
            num_columns: self
                .num_columns
                .filter(|columns| *columns != 0)
                .map(clamp_columns),
            show_labels: self.show_labels.unwrap_or(true),
        }
    }
}

/// Decoded layout document.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedLayout {
    pub parsed: ParsedEntries,
    pub num_columns: Option<u8>,
    pub show_labels: bool,
}

impl LoadedLayout {
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.parsed.entries
    }

    pub fn has_entries(&self) -> bool {
        !self.parsed.entries.is_empty()
    }
}

/// Body of `PUT /updateLayout/{patchId}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateLayoutRequest {
    pub layout: Vec<LayoutEntry>,
    #[serde(rename = "numColumns")]
    pub num_columns: u8,
    #[serde(rename = "showLabel")]
    pub show_label: bool,
}

impl UpdateLayoutRequest {
    pub fn new(layout: Vec<LayoutEntry>, num_columns: u8, show_label: bool) -> Self {
        Self {
            layout,
            num_columns: clamp_columns(num_columns as i64),
            show_label,
        }
    }
}

pub trait LayoutApi: Send + Sync {
    /// `Ok(None)` when the patch has no stored layout.
    fn fetch_layout(
        &self,
        patch_id: &str,
    ) -> impl Future<Output = Result<Option<LayoutDocument>, ApiError>> + Send;

    /// Replace the stored layout. `ApiError::NotFound` if the patch is gone.
    fn update_layout(
        &self,
        patch_id: &str,
        request: &UpdateLayoutRequest,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn fetch_ui_associations(
        &self,
        patch_id: &str,
    ) -> impl Future<Output = Result<Option<UiAssociations>, ApiError>> + Send;

    /// Exported patch document, `Ok(None)` if no patch exists.
    fn fetch_patch(&self, patch_id: &str)
    -> impl Future<Output = Result<Option<Value>, ApiError>> + Send;
}
