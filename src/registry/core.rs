use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use blake3::Hash;

use crate::error::{PatchGridError, Result};
use crate::layout::model::{LayoutEntry, WidgetAssociation};
use crate::widget::DisplayValue;

pub type WidgetId = String;

/// Board shared between the session and output subscriptions.
pub type SharedBoard = Arc<RwLock<WidgetBoard>>;

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetState {
    pub association: WidgetAssociation,
    pub display: DisplayValue,
    /// Bound to a control the live device does not have.
    pub inert: bool,
    hash: Option<Hash>,
    pub is_dirty: bool,
}

impl WidgetState {
    fn new(association: WidgetAssociation) -> Self {
        Self {
            association,
            display: DisplayValue::Empty,
            inert: false,
            hash: None,
            is_dirty: true,
        }
    }

    /// Returns whether the content changed.
    fn update_display(&mut self, display: DisplayValue) -> bool {
        let new_hash = blake3::hash(format!("{display:?}").as_bytes());
        if self.hash.map(|h| h != new_hash).unwrap_or(true) {
            self.display = display;
            self.hash = Some(new_hash);
            self.is_dirty = true;
            true
        } else {
            false
        }
    }
}

/// Rendered widgets and their last known display states.
#[derive(Debug, Default)]
pub struct WidgetBoard {
    entries: HashMap<WidgetId, WidgetState>,
    dirty: HashSet<WidgetId>,
}

impl WidgetBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBoard {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Mirror the rendered layout. New or re-associated widgets start dirty
    /// with an empty display; widgets no longer present are removed.
    pub fn sync_entries(&mut self, entries: &[LayoutEntry]) {
        use std::collections::hash_map::Entry;

        let mut newly_dirty = Vec::new();
        for entry in entries {
            match self.entries.entry(entry.widget_id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let state = occupied.get_mut();
                    if state.association != entry.association {
                        *state = WidgetState::new(entry.association.clone());
                        newly_dirty.push(entry.widget_id.clone());
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(WidgetState::new(entry.association.clone()));
                    newly_dirty.push(entry.widget_id.clone());
                }
            }
        }

        let live: HashSet<&str> = entries.iter().map(|e| e.widget_id.as_str()).collect();
        let to_remove: Vec<_> = self
            .entries
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in to_remove {
            self.entries.remove(&id);
            self.dirty.remove(&id);
        }

        self.dirty.extend(newly_dirty);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty.clear();
    }

    /// Store new display content. Returns `true` if it differed.
    pub fn apply_display(&mut self, widget_id: &str, display: DisplayValue) -> Result<bool> {
        let entry = self
            .entries
            .get_mut(widget_id)
            .ok_or_else(|| PatchGridError::WidgetNotFound(widget_id.to_string()))?;
        let changed = entry.update_display(display);
        if changed {
            self.dirty.insert(widget_id.to_string());
        }
        Ok(changed)
    }

    pub fn set_inert(&mut self, widget_id: &str, inert: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(widget_id)
            .ok_or_else(|| PatchGridError::WidgetNotFound(widget_id.to_string()))?;
        if entry.inert != inert {
            entry.inert = inert;
            entry.is_dirty = true;
            self.dirty.insert(widget_id.to_string());
        }
        Ok(())
    }

    /// Mark every listed widget inert. Returns the ids the board does not
    /// hold.
    pub fn mark_inert<'a, I>(&mut self, widget_ids: I) -> Vec<WidgetId>
    where
        I: IntoIterator<Item = &'a str>,
    {
        widget_ids
            .into_iter()
            .filter(|widget_id| self.set_inert(widget_id, true).is_err())
            .map(str::to_string)
            .collect()
    }

    pub fn take_dirty(&mut self) -> Vec<(WidgetId, WidgetState)> {
        let ids: Vec<_> = self.dirty.drain().collect();
        ids.into_iter()
            .filter_map(|id| {
                self.entries.get_mut(&id).map(|state| {
                    state.is_dirty = false;
                    (id.clone(), state.clone())
                })
            })
            .collect()
    }

    pub fn get(&self, widget_id: &str) -> Option<&WidgetState> {
        self.entries.get(widget_id)
    }

    pub fn display_of(&self, widget_id: &str) -> Option<&DisplayValue> {
        self.entries.get(widget_id).map(|state| &state.display)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::model::WidgetType;

    fn entries() -> Vec<LayoutEntry> {
        vec![
            LayoutEntry::floating("numberBox1", WidgetAssociation::new("level", WidgetType::NumberBox)),
            LayoutEntry::floating("light2", WidgetAssociation::new("beat", WidgetType::Light)),
        ]
    }

    #[test]
    fn sync_flags_new_widgets_as_dirty() {
        let mut board = WidgetBoard::new();
        board.sync_entries(&entries());
        let mut dirty: Vec<_> = board.take_dirty().into_iter().map(|(id, _)| id).collect();
        dirty.sort();
        assert_eq!(dirty, vec!["light2".to_string(), "numberBox1".to_string()]);
        assert!(!board.has_dirty());
    }

    #[test]
    fn mark_inert_reports_unknown_widgets() {
        let mut board = WidgetBoard::new();
        board.sync_entries(&entries());
        board.take_dirty();
        let missing = board.mark_inert(["light2", "dial9"]);
        assert_eq!(missing, vec!["dial9".to_string()]);
        assert!(board.get("light2").unwrap().inert);
        assert_eq!(board.take_dirty().len(), 1);
    }

    #[test]
    fn apply_display_detects_changes() {
        let mut board = WidgetBoard::new();
        board.sync_entries(&entries());
        board.take_dirty();

        let text = DisplayValue::Text("2k+".into());
        assert!(board.apply_display("numberBox1", text.clone()).unwrap());
        assert_eq!(board.take_dirty().len(), 1);

        assert!(!board.apply_display("numberBox1", text).unwrap());
        assert!(board.take_dirty().is_empty());
    }

    #[test]
    fn unknown_widget_is_an_error() {
        let mut board = WidgetBoard::new();
        assert!(matches!(
            board.apply_display("nope", DisplayValue::Empty),
            Err(PatchGridError::WidgetNotFound(_))
        ));
    }

    #[test]
    fn resync_drops_removed_widgets() {
        let mut board = WidgetBoard::new();
        board.sync_entries(&entries());
        board.apply_display("light2", DisplayValue::Text("x".into())).unwrap();
        board.sync_entries(&entries()[..1]);
        assert_eq!(board.len(), 1);
        assert!(board.get("light2").is_none());
        assert!(board.take_dirty().iter().all(|(id, _)| id == "numberBox1"));
    }
}
