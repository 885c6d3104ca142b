//! Patch layout and widget-association engine.
//!
//! Lays out control widgets for an audio patch on a column grid, resolves
//! which widget drives which parameter or shows which outport, persists the
//! arrangement, and routes traffic between rendered widgets and the running
//! patch. [`EditorSession`] ties the pieces together for one selected patch.

pub mod device;
pub mod error;
pub mod geometry;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod runtime;
pub mod widget;

pub use device::{
    AudioNode, AudioOutput, Device, DeviceError, DeviceFactory, HeadlessDeviceFactory,
    MessageEvent, MessageFilter, MessagePayload, NullAudioNode, OutportMessage, OutportSpec,
    Parameter, ParameterSpec, PatchDescription, Subscription,
};
pub use error::{PatchGridError, Result};
pub use geometry::GridRect;
pub use layout::{
    ControlType, GridEngine, GridError, GridGeometry, GridMode, Layout, LayoutEntry, PointerRoute,
    WidgetAssociation, WidgetType,
};
pub use logging::{LogEvent, LogFields, LogLevel, Logger, LoggingError, LoggingResult};
pub use metrics::{MetricSnapshot, SessionMetrics};
pub use persistence::{
    ApiError, HttpLayoutApi, LayoutApi, LayoutDocument, LoadedLayout, MemoryLayoutApi,
    UpdateLayoutRequest,
};
pub use registry::{SharedBoard, WidgetBoard, WidgetState};
pub use resolver::{ControlSet, Reconciled, UiAssociations, reconcile, resolve_defaults};
pub use router::{BindReport, EventRouter};
pub use runtime::audit::{
    NullSessionAudit, RecordingAudit, SessionAudit, SessionAuditEvent, SessionAuditEventBuilder,
    SessionAuditStage,
};
pub use runtime::{
    AudioReadiness, EditorSession, Notification, NotificationLevel, SessionConfig,
    SessionSettings,
};
pub use widget::{DisplayValue, Interaction, LightLevel, WidgetBehavior, WidgetRegistry};
