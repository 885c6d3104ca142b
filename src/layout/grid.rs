//! Grid engine - fixed column count, unbounded rows, float placement.
//!
//! The engine keeps a canonical placement table in the configured column
//! count. That table is what [`GridEngine::serialize`] returns and what gets
//! persisted. A presented placement, reflowed into the responsive column
//! count for the current container width, is derived from it on demand.
//!
//! Placement never fails on conflicts: an explicit rectangle that overlaps an
//! existing widget, or runs past the last column, falls back to the first
//! open cell scanning rows top to bottom.
//!
//! # Example
//! ```no_run
//! use patchgrid::layout::grid::GridEngine;
//! use patchgrid::{LayoutEntry, WidgetAssociation, WidgetType};
//!
//! let mut grid = GridEngine::initialize(16, 1280.0)?;
//! let entry = LayoutEntry::floating("dial1", WidgetAssociation::new("cutoff", WidgetType::Dial));
//! let rect = grid.add_widget(&entry)?;
//! assert_eq!((rect.x, rect.y), (0, 0));
//! # Ok::<(), patchgrid::layout::grid::GridError>(())
//! ```

use std::time::{Duration, Instant};

use thiserror::Error;

use super::model::{GridGeometry, LayoutEntry, MAX_COLUMNS, MIN_COLUMNS, WidgetAssociation};
use super::responsive::{ReflowDebouncer, ReflowRequest, geometry_for};
use crate::geometry::GridRect;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("column count {0} outside {MIN_COLUMNS}..={MAX_COLUMNS}")]
    InvalidColumns(u32),
    #[error("placement is frozen while interacting")]
    Frozen,
    #[error("widget `{0}` is not placed")]
    UnknownWidget(String),
    #[error("widget id `{0}` is already placed")]
    DuplicateWidget(String),
}

/// Whether pointer gestures edit placement or reach the widgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridMode {
    #[default]
    Edit,
    Interact,
}

/// Target of a pointer-down at a pixel position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerRoute {
    /// Edit mode: the gesture drags or resizes this cell.
    Cell(String),
    /// Interact mode: the gesture belongs to the widget itself.
    Widget(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PlacedWidget {
    widget_id: String,
    rect: GridRect,
    association: WidgetAssociation,
}

pub struct GridEngine {
    columns: u32,
    container_width: f32,
    geometry: GridGeometry,
    mode: GridMode,
    cells: Vec<PlacedWidget>,
    debouncer: ReflowDebouncer,
    reflow_count: u64,
}

impl GridEngine {
    /// Establish a placement surface with `columns` columns for a container
    /// `container_width` pixels wide.
    pub fn initialize(columns: u32, container_width: f32) -> Result<Self, GridError> {
        validate_columns(columns)?;
        Ok(Self {
            columns,
            container_width,
            geometry: geometry_for(columns, container_width),
            mode: GridMode::default(),
            cells: Vec::new(),
            debouncer: ReflowDebouncer::default(),
            reflow_count: 0,
        })
    }

    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.debouncer = ReflowDebouncer::new(delay);
        self
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    pub fn container_width(&self) -> f32 {
        self.container_width
    }

    pub fn mode(&self) -> GridMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: GridMode) {
        self.mode = mode;
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn reflow_count(&self) -> u64 {
        self.reflow_count
    }

    pub fn rect_of(&self, widget_id: &str) -> Option<GridRect> {
        self.cells
            .iter()
            .find(|cell| cell.widget_id == widget_id)
            .map(|cell| cell.rect)
    }

    /// Insert a widget. Entries without coordinates, or whose rectangle
    /// conflicts with the current placement, are auto-positioned.
    pub fn add_widget(&mut self, entry: &LayoutEntry) -> Result<GridRect, GridError> {
        if self.rect_of(&entry.widget_id).is_some() {
            return Err(GridError::DuplicateWidget(entry.widget_id.clone()));
        }

        let w = entry.w.clamp(1, self.columns);
        let h = entry.h.max(1);
        let rect = match (entry.x, entry.y) {
            (Some(x), Some(y)) => {
                let candidate = GridRect::new(x, y, w, h);
                if self.is_free(&candidate, None) {
                    candidate
                } else {
                    self.first_open(w, h)
                }
            }
            _ => self.first_open(w, h),
        };

        self.cells.push(PlacedWidget {
            widget_id: entry.widget_id.clone(),
            rect,
            association: entry.association.clone(),
        });
        Ok(rect)
    }

    /// Clear all placed widgets. Safe to call on an empty grid.
    pub fn remove_all(&mut self) {
        self.cells.clear();
    }

    /// Snapshot of the canonical placement for persistence.
    pub fn serialize(&self) -> Vec<LayoutEntry> {
        self.cells
            .iter()
            .map(|cell| LayoutEntry {
                widget_id: cell.widget_id.clone(),
                x: Some(cell.rect.x),
                y: Some(cell.rect.y),
                w: cell.rect.w,
                h: cell.rect.h,
                association: cell.association.clone(),
            })
            .collect()
    }

    /// Queue a reflow for a new container width. Bursts are coalesced.
    pub fn request_resize(&mut self, now: Instant, container_width: f32) {
        self.debouncer.request(
            now,
            ReflowRequest {
                container_width,
                columns: self.columns,
            },
        );
    }

    /// Explicit column-count change. Widgets that no longer fit are moved
    /// immediately; the geometry reflow is debounced.
    pub fn set_columns(&mut self, now: Instant, columns: u32) -> Result<(), GridError> {
        validate_columns(columns)?;
        if columns != self.columns {
            self.columns = columns;
            self.refit_canonical();
        }
        self.debouncer.request(
            now,
            ReflowRequest {
                container_width: self.container_width,
                columns,
            },
        );
        Ok(())
    }

    /// Apply a pending reflow once its quiet period has elapsed.
    pub fn poll_reflow(&mut self, now: Instant) -> Option<GridGeometry> {
        let request = self.debouncer.poll(now)?;
        Some(self.apply_reflow(request.container_width))
    }

    /// Recompute geometry immediately, bypassing the debouncer.
    pub fn reflow_now(&mut self, container_width: f32) -> GridGeometry {
        self.debouncer.cancel();
        self.apply_reflow(container_width)
    }

    fn apply_reflow(&mut self, container_width: f32) -> GridGeometry {
        self.container_width = container_width;
        self.geometry = geometry_for(self.columns, container_width);
        self.reflow_count += 1;
        self.geometry
    }

    /// Placement as shown at the current effective column count.
    pub fn presented(&self) -> Vec<(String, GridRect)> {
        let columns = self.geometry.columns;
        let mut order: Vec<&PlacedWidget> = self.cells.iter().collect();
        order.sort_by_key(|cell| (cell.rect.y, cell.rect.x));

        let mut shown: Vec<(String, GridRect)> = Vec::with_capacity(order.len());
        for cell in order {
            let w = cell.rect.w.min(columns);
            let wanted = GridRect::new(cell.rect.x, cell.rect.y, w, cell.rect.h);
            let taken: Vec<GridRect> = shown.iter().map(|(_, rect)| *rect).collect();
            let rect = if wanted.fits_columns(columns) && !taken.iter().any(|r| r.overlaps(&wanted))
            {
                wanted
            } else {
                first_open_in(&taken, columns, w, cell.rect.h)
            };
            shown.push((cell.widget_id.clone(), rect));
        }
        shown
    }

    /// Move a widget's cell. Widgets the move collides with are pushed down.
    pub fn move_widget(&mut self, widget_id: &str, x: u32, y: u32) -> Result<GridRect, GridError> {
        self.ensure_editable()?;
        let idx = self.index_of(widget_id)?;
        let rect = self.cells[idx].rect;
        let x = x.min(self.columns.saturating_sub(rect.w));
        self.cells[idx].rect = rect.with_origin(x, y);
        self.settle_around(idx);
        Ok(self.cells[idx].rect)
    }

    /// Resize a widget's cell, clamped to the column count.
    pub fn resize_widget(&mut self, widget_id: &str, w: u32, h: u32) -> Result<GridRect, GridError> {
        self.ensure_editable()?;
        let idx = self.index_of(widget_id)?;
        let rect = self.cells[idx].rect;
        let w = w.clamp(1, self.columns.saturating_sub(rect.x).max(1));
        self.cells[idx].rect = GridRect::new(rect.x, rect.y, w, h.max(1));
        self.settle_around(idx);
        Ok(self.cells[idx].rect)
    }

    /// Resolve a pointer-down in container pixels against the presented grid.
    pub fn pointer_route(&self, px: f32, py: f32) -> Option<PointerRoute> {
        if self.geometry.cell_size <= 0.0 || px < 0.0 || py < 0.0 {
            return None;
        }
        let col = (px / self.geometry.cell_size).floor() as u32;
        let row = (py / self.geometry.cell_size).floor() as u32;
        let (widget_id, _) = self
            .presented()
            .into_iter()
            .find(|(_, rect)| rect.contains_cell(col, row))?;
        Some(match self.mode {
            GridMode::Edit => PointerRoute::Cell(widget_id),
            GridMode::Interact => PointerRoute::Widget(widget_id),
        })
    }

    fn ensure_editable(&self) -> Result<(), GridError> {
        match self.mode {
            GridMode::Edit => Ok(()),
            GridMode::Interact => Err(GridError::Frozen),
        }
    }

    fn index_of(&self, widget_id: &str) -> Result<usize, GridError> {
        self.cells
            .iter()
            .position(|cell| cell.widget_id == widget_id)
            .ok_or_else(|| GridError::UnknownWidget(widget_id.to_string()))
    }

    fn is_free(&self, rect: &GridRect, ignore: Option<usize>) -> bool {
        rect.fits_columns(self.columns)
            && !self
                .cells
                .iter()
                .enumerate()
                .any(|(idx, cell)| Some(idx) != ignore && cell.rect.overlaps(rect))
    }

    fn first_open(&self, w: u32, h: u32) -> GridRect {
        let taken: Vec<GridRect> = self.cells.iter().map(|cell| cell.rect).collect();
        first_open_in(&taken, self.columns, w, h)
    }

    /// Keep `anchor` where it is and push every colliding widget downward,
    /// processing top to bottom so pushes cascade.
    fn settle_around(&mut self, anchor: usize) {
        let mut fixed = vec![self.cells[anchor].rect];
        let mut order: Vec<usize> = (0..self.cells.len()).filter(|idx| *idx != anchor).collect();
        order.sort_by_key(|idx| (self.cells[*idx].rect.y, self.cells[*idx].rect.x));

        for idx in order {
            let mut rect = self.cells[idx].rect;
            while let Some(blocker) = fixed.iter().find(|other| other.overlaps(&rect)) {
                rect.y = blocker.bottom();
            }
            self.cells[idx].rect = rect;
            fixed.push(rect);
        }
    }

    /// After a column reduction, re-place entries that no longer fit.
    fn refit_canonical(&mut self) {
        let columns = self.columns;
        let mut order: Vec<usize> = (0..self.cells.len()).collect();
        order.sort_by_key(|idx| (self.cells[*idx].rect.y, self.cells[*idx].rect.x));

        let mut taken: Vec<GridRect> = Vec::with_capacity(self.cells.len());
        for idx in order {
            let mut rect = self.cells[idx].rect;
            rect.w = rect.w.min(columns);
            if !rect.fits_columns(columns) || taken.iter().any(|r| r.overlaps(&rect)) {
                rect = first_open_in(&taken, columns, rect.w, rect.h);
            }
            self.cells[idx].rect = rect;
            taken.push(rect);
        }
    }
}

fn validate_columns(columns: u32) -> Result<(), GridError> {
    if (MIN_COLUMNS as u32..=MAX_COLUMNS as u32).contains(&columns) {
        Ok(())
    } else {
        Err(GridError::InvalidColumns(columns))
    }
}

/// First cell, row-major, where a `w`x`h` rectangle fits without overlap.
fn first_open_in(taken: &[GridRect], columns: u32, w: u32, h: u32) -> GridRect {
    let w = w.clamp(1, columns.max(1));
    let last_row = taken.iter().map(GridRect::bottom).max().unwrap_or(0);
    for y in 0..=last_row {
        for x in 0..=(columns - w) {
            let candidate = GridRect::new(x, y, w, h);
            if !taken.iter().any(|rect| rect.overlaps(&candidate)) {
                return candidate;
            }
        }
    }
    GridRect::new(0, last_row, w, h)
}
