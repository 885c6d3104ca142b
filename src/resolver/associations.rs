use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `controlId -> widgetType` choices recorded at upload, in the order the
/// uploader listed them. Widget types are kept raw so unknown ones can be
/// reported instead of failing the whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiAssociations {
    pairs: Vec<(String, String)>,
}

impl UiAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut associations = Self::new();
        for (control_id, widget_type) in pairs {
            associations.insert(control_id, widget_type);
        }
        associations
    }

    /// Insert or replace; a replaced control keeps its original position.
    pub fn insert(&mut self, control_id: impl Into<String>, widget_type: impl Into<String>) {
        let control_id = control_id.into();
        let widget_type = widget_type.into();
        match self.pairs.iter_mut().find(|(id, _)| *id == control_id) {
            Some((_, existing)) => *existing = widget_type,
            None => self.pairs.push((control_id, widget_type)),
        }
    }

    pub fn get(&self, control_id: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(id, _)| id == control_id)
            .map(|(_, ty)| ty.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(id, ty)| (id.as_str(), ty.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Serialize for UiAssociations {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (control_id, widget_type) in &self.pairs {
            map.serialize_entry(control_id, widget_type)?;
        }
        map.end()
    }
}

struct OrderedVisitor;

impl<'de> Visitor<'de> for OrderedVisitor {
    type Value = UiAssociations;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object mapping control ids to widget types")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut associations = UiAssociations::new();
        while let Some((control_id, widget_type)) = access.next_entry::<String, String>()? {
            associations.insert(control_id, widget_type);
        }
        Ok(associations)
    }
}

impl<'de> Deserialize<'de> for UiAssociations {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_order_is_preserved() {
        let parsed: UiAssociations =
            serde_json::from_str(r#"{"zeta": "dial", "alpha": "button", "mid": "light"}"#).unwrap();
        let ids: Vec<_> = parsed.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"{"zeta":"dial","alpha":"button","mid":"light"}"#
        );
    }

    #[test]
    fn reinsert_keeps_position() {
        let mut assoc = UiAssociations::from_pairs([("a", "dial"), ("b", "switch")]);
        assoc.insert("a", "hslider");
        assert_eq!(assoc.get("a"), Some("hslider"));
        assert_eq!(assoc.iter().next(), Some(("a", "hslider")));
        assert_eq!(assoc.len(), 2);
    }
}
