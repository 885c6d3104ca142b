use thiserror::Error;

use crate::device::DeviceError;
use crate::layout::GridError;
use crate::persistence::ApiError;

/// Unified result type for the patchgrid crate.
pub type Result<T> = std::result::Result<T, PatchGridError>;

/// Errors surfaced by the layout editor core.
#[derive(Debug, Error)]
pub enum PatchGridError {
    #[error("no patch selected")]
    NoPatchSelected,
    #[error("no device attached")]
    NoDevice,
    #[error("widget `{0}` not found")]
    WidgetNotFound(String),
    #[error("grid error: {0}")]
    Grid(#[from] GridError),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
