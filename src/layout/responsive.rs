//! Viewport-driven presentation rules for the grid.
//!
//! The configured column count is what gets persisted; everything here only
//! affects how that arrangement is shown at the current container width.

use std::time::{Duration, Instant};

use super::model::GridGeometry;

/// Lowest column count the responsive transform will present.
pub const MIN_RESPONSIVE_COLUMNS: u32 = 2;

/// Default quiet period before a burst of resize requests is applied.
pub const DEFAULT_REFLOW_DEBOUNCE: Duration = Duration::from_millis(300);

/// `(exclusive upper width bound, columns removed)`, narrowest first.
const COLUMN_BREAKPOINTS: [(f32, u32); 4] = [(375.0, 8), (640.0, 6), (800.0, 4), (1024.0, 2)];

/// `(exclusive upper width bound, margin px)`, narrowest first.
const MARGIN_BREAKPOINTS: [(f32, f32); 4] = [(375.0, 2.0), (640.0, 2.0), (800.0, 4.0), (1024.0, 6.0)];
const WIDE_MARGIN: f32 = 10.0;

/// Effective column count for a container `width` given the configured count.
pub fn responsive_columns(configured: u32, width: f32) -> u32 {
    let reduction = COLUMN_BREAKPOINTS
        .iter()
        .find(|(bound, _)| width < *bound)
        .map(|(_, cut)| *cut)
        .unwrap_or(0);
    configured
        .saturating_sub(reduction)
        .max(MIN_RESPONSIVE_COLUMNS)
}

pub fn margin_for_width(width: f32) -> f32 {
    MARGIN_BREAKPOINTS
        .iter()
        .find(|(bound, _)| width < *bound)
        .map(|(_, margin)| *margin)
        .unwrap_or(WIDE_MARGIN)
}

/// Square cell geometry for the configured column count at `width`.
pub fn geometry_for(configured: u32, width: f32) -> GridGeometry {
    let columns = responsive_columns(configured, width);
    let cell_size = if width > 0.0 {
        (width / columns as f32).round()
    } else {
        0.0
    };
    GridGeometry {
        columns,
        cell_size,
        margin_px: margin_for_width(width),
    }
}

/// Latest requested reflow inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflowRequest {
    pub container_width: f32,
    pub columns: u32,
}

/// Trailing-edge debouncer: a request is released once no newer request has
/// arrived for `delay`. Only the latest request in a burst survives.
#[derive(Debug, Clone)]
pub struct ReflowDebouncer {
    delay: Duration,
    pending: Option<(ReflowRequest, Instant)>,
}

impl Default for ReflowDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_REFLOW_DEBOUNCE)
    }
}

impl ReflowDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn request(&mut self, now: Instant, request: ReflowRequest) {
        self.pending = Some((request, now + self.delay));
    }

    pub fn poll(&mut self, now: Instant) -> Option<ReflowRequest> {
        match self.pending {
            Some((request, due)) if now >= due => {
                self.pending = None;
                Some(request)
            }
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
