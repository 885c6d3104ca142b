//! Widget registry: static behaviour table keyed by [`WidgetType`].
//!
//! The table is the only place that knows how a widget kind interacts.
//! Everything else dispatches on the enum carried by each association.

mod display;
mod gesture;

pub use display::{DisplayValue, LightLevel, format_number};
pub use gesture::{DialGeometry, DragGesture};

use crate::layout::model::{ControlType, WidgetType};

/// Axis along which a continuous widget is dragged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragAxis {
    /// Upward pointer motion increases the value.
    Vertical,
    /// Rightward pointer motion increases the value.
    Horizontal,
    /// Vertical drag mapped onto the dial's sweep.
    Rotary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Light,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    /// Press writes the maximum, a scheduled reset writes the minimum.
    Momentary,
    /// Each press flips between minimum and maximum.
    Toggle,
    Continuous(DragAxis),
    Display(DisplayKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetBehavior {
    pub widget_type: WidgetType,
    pub interaction: Interaction,
    pub default_size: (u32, u32),
}

impl WidgetBehavior {
    pub fn control_type(&self) -> ControlType {
        self.widget_type.control_type()
    }

    pub fn is_input(&self) -> bool {
        !matches!(self.interaction, Interaction::Display(_))
    }
}

const TABLE: [WidgetBehavior; 7] = [
    WidgetBehavior {
        widget_type: WidgetType::Button,
        interaction: Interaction::Momentary,
        default_size: (1, 1),
    },
    WidgetBehavior {
        widget_type: WidgetType::Switch,
        interaction: Interaction::Toggle,
        default_size: (1, 1),
    },
    WidgetBehavior {
        widget_type: WidgetType::Dial,
        interaction: Interaction::Continuous(DragAxis::Rotary),
        default_size: (1, 1),
    },
    WidgetBehavior {
        widget_type: WidgetType::VSlider,
        interaction: Interaction::Continuous(DragAxis::Vertical),
        default_size: (1, 3),
    },
    WidgetBehavior {
        widget_type: WidgetType::HSlider,
        interaction: Interaction::Continuous(DragAxis::Horizontal),
        default_size: (3, 1),
    },
    WidgetBehavior {
        widget_type: WidgetType::Light,
        interaction: Interaction::Display(DisplayKind::Light),
        default_size: (1, 1),
    },
    WidgetBehavior {
        widget_type: WidgetType::NumberBox,
        interaction: Interaction::Display(DisplayKind::Number),
        default_size: (1, 1),
    },
];

pub struct WidgetRegistry;

impl WidgetRegistry {
    pub fn lookup(widget_type: WidgetType) -> &'static WidgetBehavior {
        match widget_type {
            WidgetType::Button => &TABLE[0],
            WidgetType::Switch => &TABLE[1],
            WidgetType::Dial => &TABLE[2],
            WidgetType::VSlider => &TABLE[3],
            WidgetType::HSlider => &TABLE[4],
            WidgetType::Light => &TABLE[5],
            WidgetType::NumberBox => &TABLE[6],
        }
    }

    pub fn all() -> &'static [WidgetBehavior] {
        &TABLE
    }

    /// Widget kinds a user may pick for a control of `control_type`.
    pub fn choices_for(control_type: ControlType) -> impl Iterator<Item = WidgetType> {
        TABLE
            .iter()
            .filter(move |behavior| behavior.control_type() == control_type)
            .map(|behavior| behavior.widget_type)
    }
}
