//! Association resolver.
//!
//! Turns the control-to-widget choices recorded at upload time into layout
//! entries, and decides between a saved layout and those defaults.

mod associations;

pub use associations::UiAssociations;

use std::collections::HashSet;

use crate::device::{Device, PatchDescription};
use crate::layout::model::{
    ControlType, DEFAULT_COLUMNS, LayoutEntry, WidgetAssociation, WidgetType, clamp_columns,
};

/// Column count used when arranging widgets at upload time.
pub const UPLOAD_COLUMNS: u32 = DEFAULT_COLUMNS as u32;

/// Controls declared by the loaded patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlSet {
    parameters: HashSet<String>,
    outports: HashSet<String>,
}

impl ControlSet {
    pub fn new<P, O>(parameters: P, outports: O) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            parameters: parameters.into_iter().map(Into::into).collect(),
            outports: outports.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_description(description: &PatchDescription) -> Self {
        Self::new(
            description.parameters.iter().map(|p| p.id.clone()),
            description.outports.iter().map(|p| p.tag.clone()),
        )
    }

    pub fn from_device(device: &Device) -> Self {
        Self::new(
            device.parameters().iter().map(|p| p.id().to_string()),
            device.outports().iter().cloned(),
        )
    }

    /// Controls implied by the upload-time choices themselves, for when the
    /// patch description cannot be read.
    pub fn from_associations(associations: &UiAssociations) -> Self {
        let mut controls = Self::default();
        for (control_id, raw_type) in associations.iter() {
            match raw_type.parse::<WidgetType>().map(|ty| ty.control_type()) {
                Ok(ControlType::Parameter) => {
                    controls.parameters.insert(control_id.to_string());
                }
                Ok(ControlType::Outport) => {
                    controls.outports.insert(control_id.to_string());
                }
                Err(_) => {}
            }
        }
        controls
    }

    /// Whether `association` names a control of the kind its widget needs.
    pub fn supports(&self, association: &WidgetAssociation) -> bool {
        match association.widget_type.control_type() {
            ControlType::Parameter => self.parameters.contains(&association.control_id),
            ControlType::Outport => self.outports.contains(&association.control_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.outports.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownWidgetType(String),
    /// The control is missing, or is the wrong kind for the widget.
    UnsupportedControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedAssociation {
    pub control_id: String,
    pub reason: SkipReason,
}

/// Usable associations in upload order, plus what was left out.
fn usable(
    associations: &UiAssociations,
    controls: &ControlSet,
) -> (Vec<WidgetAssociation>, Vec<SkippedAssociation>) {
    let mut kept = Vec::new();
    let mut skipped = Vec::new();
    for (control_id, raw_type) in associations.iter() {
        let Ok(widget_type) = raw_type.parse::<WidgetType>() else {
            skipped.push(SkippedAssociation {
                control_id: control_id.to_string(),
                reason: SkipReason::UnknownWidgetType(raw_type.to_string()),
            });
            continue;
        };
        let association = WidgetAssociation::new(control_id, widget_type);
        if controls.supports(&association) {
            kept.push(association);
        } else {
            skipped.push(SkippedAssociation {
                control_id: control_id.to_string(),
                reason: SkipReason::UnsupportedControl,
            });
        }
    }
    (kept, skipped)
}

/// Default entries, one per usable association, in upload order. Entries
/// carry default sizes and no position; the grid packs them.
pub fn resolve_defaults(associations: &UiAssociations, controls: &ControlSet) -> Vec<LayoutEntry> {
    usable(associations, controls)
        .0
        .into_iter()
        .enumerate()
        .map(|(index, association)| {
            let widget_id = association.widget_type.widget_id(index + 1);
            LayoutEntry::floating(widget_id, association)
        })
        .collect()
}

/// Associations [`resolve_defaults`] leaves out, for diagnostics.
pub fn skipped_associations(
    associations: &UiAssociations,
    controls: &ControlSet,
) -> Vec<SkippedAssociation> {
    usable(associations, controls).1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub entries: Vec<LayoutEntry>,
    /// Entries kept from the saved layout whose control is no longer present.
    pub inert: Vec<String>,
    pub from_saved: bool,
}

/// A non-empty saved layout is used verbatim; entries whose control has
/// disappeared stay in the layout and are reported as inert. Otherwise the
/// defaults are resolved.
pub fn reconcile(
    saved: Option<&[LayoutEntry]>,
    associations: &UiAssociations,
    controls: &ControlSet,
) -> Reconciled {
    match saved {
        Some(entries) if !entries.is_empty() => Reconciled {
            inert: entries
                .iter()
                .filter(|entry| !controls.supports(&entry.association))
                .map(|entry| entry.widget_id.clone())
                .collect(),
            entries: entries.to_vec(),
            from_saved: true,
        },
        _ => Reconciled {
            entries: resolve_defaults(associations, controls),
            inert: Vec::new(),
            from_saved: false,
        },
    }
}

/// Explicit arrangement written alongside the associations at upload.
///
/// Widgets are laid left to right across a 16-column row, wrapping when the
/// next widget would not fit. Each widget sits on top of whatever is already
/// in its columns, so a vertical slider pushes later widgets in its column
/// below it.
pub fn arrange_for_upload(associations: &UiAssociations, controls: &ControlSet) -> Vec<LayoutEntry> {
    let mut skyline = vec![0u32; UPLOAD_COLUMNS as usize];
    let mut x = 0u32;
    let mut row = 0u32;

    resolve_defaults(associations, controls)
        .into_iter()
        .map(|entry| {
            let (w, h) = (entry.w.min(UPLOAD_COLUMNS), entry.h);
            if x + w > UPLOAD_COLUMNS {
                x = 0;
                row += 1;
            }
            let span = x as usize..(x + w) as usize;
            let y = skyline[span.clone()].iter().copied().fold(row, u32::max);
            for floor in &mut skyline[span] {
                *floor = y + h;
            }
            let placed = entry.at(x, y).sized(w, h);
            x += w;
            if x == UPLOAD_COLUMNS {
                x = 0;
                row += 1;
            }
            placed
        })
        .collect()
}

/// Column count for a layout: an unsaved user choice wins over the stored
/// value, which wins over the default.
pub fn resolve_columns(pending: Option<u8>, persisted: Option<u8>) -> u8 {
    pending
        .or(persisted)
        .map(|columns| clamp_columns(columns as i64))
        .unwrap_or(DEFAULT_COLUMNS)
}
