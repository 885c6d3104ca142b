use super::DragAxis;

/// Relative drag on a continuous widget.
///
/// The value moves by the pointer's delta from where the drag started,
/// scaled by the widget's extent along the drag axis. Grabbing the widget
/// again resumes from its current value instead of jumping to the pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragGesture {
    axis: DragAxis,
    origin_px: (f32, f32),
    origin_value: f64,
    extent_px: f32,
}

impl DragGesture {
    /// `value` is the current normalized value, `extent_px` the widget's size
    /// along the drag axis (height for vertical and rotary drags).
    pub fn begin(axis: DragAxis, pointer: (f32, f32), value: f64, extent_px: f32) -> Self {
        Self {
            axis,
            origin_px: pointer,
            origin_value: value.clamp(0.0, 1.0),
            extent_px: extent_px.max(1.0),
        }
    }

    pub fn axis(&self) -> DragAxis {
        self.axis
    }

    /// Normalized value for the pointer at `pointer`.
    pub fn value_at(&self, pointer: (f32, f32)) -> f64 {
        let delta = match self.axis {
            DragAxis::Horizontal => pointer.0 - self.origin_px.0,
            DragAxis::Vertical | DragAxis::Rotary => self.origin_px.1 - pointer.1,
        };
        let moved = f64::from(delta) / f64::from(self.extent_px);
        (self.origin_value + moved).clamp(0.0, 1.0)
    }
}

/// Angular sweep of a dial, centred on the bottom of the circle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DialGeometry {
    pub degrees: f64,
}

impl Default for DialGeometry {
    fn default() -> Self {
        Self { degrees: 360.0 }
    }
}

impl DialGeometry {
    pub fn new(degrees: f64) -> Self {
        Self {
            degrees: degrees.clamp(1.0, 360.0),
        }
    }

    pub fn start_angle(&self) -> f64 {
        (360.0 - self.degrees) / 2.0
    }

    pub fn end_angle(&self) -> f64 {
        self.start_angle() + self.degrees
    }

    pub fn angle_for(&self, normalized: f64) -> f64 {
        self.start_angle() + normalized.clamp(0.0, 1.0) * self.degrees
    }

    pub fn value_for(&self, angle: f64) -> f64 {
        let angle = angle.clamp(self.start_angle(), self.end_angle());
        (angle - self.start_angle()) / self.degrees
    }
}
