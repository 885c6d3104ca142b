mod core;

pub use self::core::{SharedBoard, WidgetBoard, WidgetId, WidgetState};
