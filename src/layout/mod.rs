//! Layout module orchestrator.
//!
//! `model` holds the persisted shape of a layout, `responsive` the
//! viewport-driven presentation rules, and `grid` the placement engine that
//! ties them together.

pub mod grid;
pub mod model;
pub mod responsive;

pub use grid::{GridEngine, GridError, GridMode, PointerRoute};
pub use model::{
    ControlType, DEFAULT_COLUMNS, GridGeometry, Layout, LayoutEntry, MAX_COLUMNS, MIN_COLUMNS,
    ParsedEntries, WidgetAssociation, WidgetType, clamp_columns, parse_entries,
};
pub use responsive::{ReflowDebouncer, ReflowRequest, geometry_for, responsive_columns};
