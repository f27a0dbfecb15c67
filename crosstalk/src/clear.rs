//! Bulk-clear filters: AND across criteria, OR within a criterion.
//!
//! A clear request names optional lists of ids, types and origins. An
//! omitted or empty list is a wildcard for that criterion; an envelope
//! is removed when every provided criterion matches. The same filter
//! shape travels inside remote-clear control envelopes, where matching
//! is additionally restricted to the clearing endpoint's own origin.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Criteria for clearing received messages or sent history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<String>,
}

impl ClearFilter {
    /// All criteria wildcarded — matches everything.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn by_ids<I: Into<String>>(ids: impl IntoIterator<Item = I>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn by_types<I: Into<String>>(types: impl IntoIterator<Item = I>) -> Self {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// AND across provided criteria, OR within each list.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        list_matches(&self.ids, &envelope.id)
            && list_matches(&self.types, &envelope.kind)
            && list_matches(&self.origins, &envelope.source)
    }

    /// The filter carried in a remote-clear envelope. Origin scoping is
    /// enforced by the receiver from the envelope's source, so only ids
    /// and types travel.
    pub fn for_broadcast(&self) -> Self {
        Self {
            ids: self.ids.clone(),
            types: self.types.clone(),
            origins: Vec::new(),
        }
    }
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

/// Remove every matching envelope from `store`; returns how many.
pub fn clear_matching(store: &mut Vec<Envelope>, filter: &ClearFilter) -> usize {
    let before = store.len();
    store.retain(|env| !filter.matches(env));
    before - store.len()
}

/// Remove matching envelopes restricted to one origin; returns how many.
///
/// Used for sent-history clears (scoped to our own identity) and for
/// applying a remote clear (scoped to the clearing envelope's origin).
pub fn clear_matching_from(store: &mut Vec<Envelope>, filter: &ClearFilter, origin: &str) -> usize {
    let before = store.len();
    store.retain(|env| env.source != origin || !filter.matches(env));
    before - store.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendOptions;
    use serde_json::Value;

    fn envelope(id: &str, kind: &str, source: &str) -> Envelope {
        let mut env = Envelope::build(kind, Value::Null, source, &SendOptions::default());
        env.id = id.to_string();
        env
    }

    #[test]
    fn test_and_across_criteria() {
        let mut store = vec![envelope("a", "x", "s1"), envelope("b", "y", "s1")];
        let filter = ClearFilter {
            ids: vec!["a".into()],
            types: vec!["x".into()],
            ..ClearFilter::default()
        };
        assert_eq!(clear_matching(&mut store, &filter), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].id, "b");
    }

    #[test]
    fn test_and_mismatch_removes_nothing() {
        // id "a" exists but with type "x", not "y" — AND fails.
        let mut store = vec![envelope("a", "x", "s1")];
        let filter = ClearFilter {
            ids: vec!["a".into()],
            types: vec!["y".into()],
            ..ClearFilter::default()
        };
        assert_eq!(clear_matching(&mut store, &filter), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_or_within_list() {
        let mut store = vec![
            envelope("a", "x", "s1"),
            envelope("b", "y", "s1"),
            envelope("c", "z", "s1"),
        ];
        let filter = ClearFilter::by_types(["x", "y"]);
        assert_eq!(clear_matching(&mut store, &filter), 2);
        assert_eq!(store[0].id, "c");
    }

    #[test]
    fn test_no_criteria_clears_everything() {
        let mut store = vec![envelope("a", "x", "s1"), envelope("b", "y", "s2")];
        assert_eq!(clear_matching(&mut store, &ClearFilter::everything()), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_origin_criterion() {
        let mut store = vec![envelope("a", "x", "s1"), envelope("b", "x", "s2")];
        let filter = ClearFilter {
            origins: vec!["s2".into()],
            ..ClearFilter::default()
        };
        assert_eq!(clear_matching(&mut store, &filter), 1);
        assert_eq!(store[0].source, "s1");
    }

    #[test]
    fn test_origin_restricted_clear() {
        let mut store = vec![
            envelope("a", "x", "s1"),
            envelope("b", "x", "s2"),
            envelope("c", "y", "s1"),
        ];
        // Wildcard filter, but only s1's envelopes may go.
        let removed = clear_matching_from(&mut store, &ClearFilter::everything(), "s1");
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].source, "s2");
    }

    #[test]
    fn test_origin_restricted_clear_with_criteria() {
        let mut store = vec![envelope("a", "x", "s1"), envelope("b", "y", "s1")];
        let removed = clear_matching_from(&mut store, &ClearFilter::by_types(["x"]), "s1");
        assert_eq!(removed, 1);
        assert_eq!(store[0].id, "b");
    }

    #[test]
    fn test_broadcast_form_drops_origins() {
        let filter = ClearFilter {
            ids: vec!["a".into()],
            types: vec!["x".into()],
            origins: vec!["s1".into()],
        };
        let wire = filter.for_broadcast();
        assert_eq!(wire.ids, filter.ids);
        assert_eq!(wire.types, filter.types);
        assert!(wire.origins.is_empty());
    }

    #[test]
    fn test_wire_roundtrip() {
        let filter = ClearFilter::by_ids(["a", "b"]);
        let value = serde_json::to_value(&filter).unwrap();
        // Empty lists stay off the wire.
        assert!(value.get("types").is_none());
        let back: ClearFilter = serde_json::from_value(value).unwrap();
        assert_eq!(back, filter);
    }
}
