//! Serializable layout model: widget kinds, control associations, and the
//! per-patch arrangement persisted through the layout API.
//!
//! Stored layouts come from several generations of the editor, so parsing is
//! lenient at the entry level: [`parse_entries`] upgrades legacy entries,
//! fills in default sizes, de-duplicates widget ids, and drops entries it
//! cannot interpret instead of failing the whole layout.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::geometry::GridRect;

pub const DEFAULT_COLUMNS: u8 = 16;
pub const MIN_COLUMNS: u8 = 1;
pub const MAX_COLUMNS: u8 = 30;

/// Clamp a stored or user supplied column count into the supported range.
pub fn clamp_columns(columns: i64) -> u8 {
    columns.clamp(MIN_COLUMNS as i64, MAX_COLUMNS as i64) as u8
}

/// On-screen element kinds a patch control can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WidgetType {
    #[serde(rename = "button")]
    Button,
    #[serde(rename = "switch")]
    Switch,
    #[serde(rename = "dial")]
    Dial,
    #[serde(rename = "vslider")]
    VSlider,
    #[serde(rename = "hslider")]
    HSlider,
    #[serde(rename = "light")]
    Light,
    #[serde(rename = "numberBox")]
    NumberBox,
}

impl WidgetType {
    pub const ALL: [WidgetType; 7] = [
        WidgetType::Button,
        WidgetType::Switch,
        WidgetType::Dial,
        WidgetType::VSlider,
        WidgetType::HSlider,
        WidgetType::Light,
        WidgetType::NumberBox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetType::Button => "button",
            WidgetType::Switch => "switch",
            WidgetType::Dial => "dial",
            WidgetType::VSlider => "vslider",
            WidgetType::HSlider => "hslider",
            WidgetType::Light => "light",
            WidgetType::NumberBox => "numberBox",
        }
    }

    /// Kind of patch control this widget binds to.
    pub fn control_type(&self) -> ControlType {
        match self {
            WidgetType::Light | WidgetType::NumberBox => ControlType::Outport,
            _ => ControlType::Parameter,
        }
    }

    /// Default `(w, h)` in grid cells.
    pub fn default_size(&self) -> (u32, u32) {
        match self {
            WidgetType::HSlider => (3, 1),
            WidgetType::VSlider => (1, 3),
            _ => (1, 1),
        }
    }

    /// Deterministic widget id for the `ordinal`-th widget (1-based).
    pub fn widget_id(&self, ordinal: usize) -> String {
        format!("{}{}", self.as_str(), ordinal)
    }
}

impl fmt::Display for WidgetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown widget type `{0}`")]
pub struct UnknownWidgetType(pub String);

impl FromStr for WidgetType {
    type Err = UnknownWidgetType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WidgetType::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| UnknownWidgetType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    Parameter,
    Outport,
}

/// Binding between a widget and the parameter or outport it drives.
///
/// On the wire the control id and widget type travel as `id` and `type`;
/// `controlType` is always re-derived from the widget type when reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireAssociation")]
pub struct WidgetAssociation {
    #[serde(rename = "id")]
    pub control_id: String,
    #[serde(rename = "controlType")]
    pub control_type: ControlType,
    #[serde(rename = "type")]
    pub widget_type: WidgetType,
}

impl WidgetAssociation {
    pub fn new(control_id: impl Into<String>, widget_type: WidgetType) -> Self {
        Self {
            control_id: control_id.into(),
            control_type: widget_type.control_type(),
            widget_type,
        }
    }
}

#[derive(Deserialize)]
struct WireAssociation {
    id: String,
    #[serde(rename = "type")]
    widget_type: WidgetType,
}

impl From<WireAssociation> for WidgetAssociation {
    fn from(raw: WireAssociation) -> Self {
        WidgetAssociation::new(raw.id, raw.widget_type)
    }
}

/// One widget's grid placement plus its association.
///
/// `x`/`y` are optional on input: an entry without coordinates is
/// auto-positioned by the grid engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutEntry {
    #[serde(rename = "id")]
    pub widget_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<u32>,
    pub w: u32,
    pub h: u32,
    pub association: WidgetAssociation,
}

impl LayoutEntry {
    /// Entry with the widget type's default size and no explicit position.
    pub fn floating(widget_id: impl Into<String>, association: WidgetAssociation) -> Self {
        let (w, h) = association.widget_type.default_size();
        Self {
            widget_id: widget_id.into(),
            x: None,
            y: None,
            w,
            h,
            association,
        }
    }

    pub fn at(mut self, x: u32, y: u32) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn sized(mut self, w: u32, h: u32) -> Self {
        self.w = w.max(1);
        self.h = h.max(1);
        self
    }

    pub fn widget_type(&self) -> WidgetType {
        self.association.widget_type
    }

    /// Explicit rectangle, if both coordinates are present.
    pub fn rect(&self) -> Option<GridRect> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(GridRect::new(x, y, self.w, self.h)),
            _ => None,
        }
    }

    /// Placement tuple used for order-independent comparisons.
    pub fn placement_key(&self) -> (Option<u32>, Option<u32>, u32, u32, WidgetAssociation) {
        (self.x, self.y, self.w, self.h, self.association.clone())
    }
}

/// Entry shape as found in stored layouts, including legacy records.
#[derive(Debug, Deserialize)]
struct StoredEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    x: Option<u32>,
    #[serde(default)]
    y: Option<u32>,
    #[serde(default)]
    w: Option<u32>,
    #[serde(default)]
    h: Option<u32>,
    #[serde(default)]
    association: Option<WidgetAssociation>,
}

impl StoredEntry {
    fn association(&self) -> Option<WidgetAssociation> {
        if let Some(association) = &self.association {
            return Some(association.clone());
        }
        // Legacy records encode the association in the id as `type-controlId`.
        let id = self.id.as_deref()?;
        let (ty, control) = id.split_once('-')?;
        let widget_type = ty.parse::<WidgetType>().ok()?;
        if control.is_empty() {
            return None;
        }
        Some(WidgetAssociation::new(control, widget_type))
    }
}

/// Outcome of parsing a stored layout array.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedEntries {
    pub entries: Vec<LayoutEntry>,
    /// Zero-based indices of records that could not be interpreted.
    pub dropped: Vec<usize>,
}

/// Parse stored layout records leniently.
pub fn parse_entries(records: &[Value]) -> ParsedEntries {
    let mut parsed = ParsedEntries::default();
    let mut pending: Vec<(Option<String>, StoredEntry, WidgetAssociation)> = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        let stored: StoredEntry = match StoredEntry::deserialize(record) {
            Ok(stored) => stored,
            Err(_) => {
                parsed.dropped.push(idx);
                continue;
            }
        };
        match stored.association() {
            Some(association) => {
                // Legacy `type-controlId` ids are replaced with ordinal ids.
                let id = stored
                    .id
                    .clone()
                    .filter(|id| stored.association.is_some() && !id.is_empty());
                pending.push((id, stored, association));
            }
            None => parsed.dropped.push(idx),
        }
    }

    let mut seen: HashSet<String> = pending
        .iter()
        .filter_map(|(id, _, _)| id.clone())
        .collect();
    let mut claimed: HashSet<String> = HashSet::new();

    for (ordinal, (id, stored, association)) in pending.into_iter().enumerate() {
        let widget_type = association.widget_type;
        let widget_id = match id {
            Some(id) if claimed.insert(id.clone()) => id,
            _ => {
                let mut n = ordinal + 1;
                loop {
                    let candidate = widget_type.widget_id(n);
                    if !seen.contains(&candidate) && claimed.insert(candidate.clone()) {
                        seen.insert(candidate.clone());
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        let (dw, dh) = widget_type.default_size();
        parsed.entries.push(LayoutEntry {
            widget_id,
            x: stored.x,
            y: stored.y,
            w: stored.w.unwrap_or(dw).max(1),
            h: stored.h.unwrap_or(dh).max(1),
            association,
        });
    }

    parsed
}

/// Saved arrangement of widgets for one patch.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub patch_id: String,
    pub entries: Vec<LayoutEntry>,
    pub num_columns: u8,
    pub show_labels: bool,
}

impl Layout {
    pub fn new(patch_id: impl Into<String>, entries: Vec<LayoutEntry>) -> Self {
        Self {
            patch_id: patch_id.into(),
            entries,
            num_columns: DEFAULT_COLUMNS,
            show_labels: true,
        }
    }

    pub fn with_columns(mut self, columns: u8) -> Self {
        self.num_columns = clamp_columns(columns as i64);
        self
    }

    pub fn with_labels(mut self, show: bool) -> Self {
        self.show_labels = show;
        self
    }
}

/// Derived cell geometry for the current viewport. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    pub columns: u32,
    pub cell_size: f32,
    pub margin_px: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn widget_type_names_round_trip_through_from_str() {
        for ty in WidgetType::ALL {
            assert_eq!(ty.as_str().parse::<WidgetType>().unwrap(), ty);
        }
        let err = "knob".parse::<WidgetType>().unwrap_err();
        assert_eq!(err, UnknownWidgetType("knob".into()));
        assert_eq!(err.to_string(), "unknown widget type `knob`");
    }

    #[test]
    fn default_sizes_follow_slider_orientation() {
        assert_eq!(WidgetType::HSlider.default_size(), (3, 1));
        assert_eq!(WidgetType::VSlider.default_size(), (1, 3));
        assert_eq!(WidgetType::Dial.default_size(), (1, 1));
        assert_eq!(WidgetType::NumberBox.default_size(), (1, 1));
    }

    #[test]
    fn association_wire_shape_uses_id_and_type() {
        let assoc = WidgetAssociation::new("cutoff", WidgetType::Dial);
        let value = serde_json::to_value(&assoc).unwrap();
        assert_eq!(value["id"], "cutoff");
        assert_eq!(value["type"], "dial");
        assert_eq!(value["controlType"], "parameter");

        let back: WidgetAssociation =
            serde_json::from_value(json!({"id": "level", "type": "numberBox"})).unwrap();
        assert_eq!(back.control_type, ControlType::Outport);
    }

    #[test]
    fn parse_fills_default_sizes_and_keeps_positions() {
        let records = vec![
            json!({"id": "vslider1", "x": 2, "y": 0, "association": {"id": "gain", "type": "vslider"}, "content": "<div/>"}),
            json!({"id": "dial2", "association": {"id": "cutoff", "type": "dial"}}),
        ];
        let parsed = parse_entries(&records);
        assert!(parsed.dropped.is_empty());
        assert_eq!(parsed.entries[0].rect(), Some(GridRect::new(2, 0, 1, 3)));
        assert_eq!(parsed.entries[1].rect(), None);
        assert_eq!((parsed.entries[1].w, parsed.entries[1].h), (1, 1));
    }

    #[test]
    fn legacy_ids_are_upgraded_and_garbage_dropped() {
        let records = vec![
            json!({"id": "switch-gate", "x": 0, "y": 0, "w": 1, "h": 1}),
            json!({"id": "mystery", "x": 1, "y": 0}),
            json!("not an entry"),
        ];
        let parsed = parse_entries(&records);
        assert_eq!(parsed.dropped, vec![1, 2]);
        assert_eq!(parsed.entries.len(), 1);
        let entry = &parsed.entries[0];
        assert_eq!(entry.association, WidgetAssociation::new("gate", WidgetType::Switch));
        assert_eq!(entry.widget_id, "switch1");
    }

    #[test]
    fn duplicate_ids_are_reassigned() {
        let records = vec![
            json!({"id": "dial1", "association": {"id": "a", "type": "dial"}}),
            json!({"id": "dial1", "association": {"id": "b", "type": "dial"}}),
        ];
        let parsed = parse_entries(&records);
        let ids: HashSet<_> = parsed.entries.iter().map(|e| e.widget_id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(parsed.entries[0].widget_id, "dial1");
    }

    #[test]
    fn serialized_entry_omits_absent_coordinates() {
        let entry = LayoutEntry::floating("light1", WidgetAssociation::new("beat", WidgetType::Light));
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("x").is_none());
        assert_eq!(value["id"], "light1");
        assert_eq!(value["w"], 1);
    }

    #[test]
    fn column_clamping() {
        assert_eq!(clamp_columns(0), 1);
        assert_eq!(clamp_columns(45), 30);
        assert_eq!(Layout::new("p", Vec::new()).with_columns(0).num_columns, 1);
    }
}
