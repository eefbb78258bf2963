use bytes::Bytes;
use std::collections::HashMap;

pub(crate) enum EagerGetState {
    /// Not enough information locally, the machine has to ask the supervisor.
    Unknown,
    /// The key holds the default value (absent, cleared, or empty bytes).
    Default,
    Value(Bytes),
}

pub(crate) enum EagerGetStateKeys {
    /// Not enough information locally, the machine has to ask the supervisor.
    Unknown,
    Keys(Vec<String>),
}

/// In-memory mirror of the invocation's key/value state, seeded from the
/// Start frame and kept coherent with local mutations.
pub(crate) struct EagerState {
    /// True when the snapshot covers every key, so absence means default.
    complete: bool,
    /// `None` marks a cleared key.
    values: HashMap<String, Option<Bytes>>,
}

impl Default for EagerState {
    fn default() -> Self {
        Self {
            complete: false,
            values: Default::default(),
        }
    }
}

impl EagerState {
    pub(crate) fn new(complete: bool, values: Vec<(String, Bytes)>) -> Self {
        Self {
            complete,
            values: values
                .into_iter()
                .map(|(key, val)| (key, Some(val)))
                .collect(),
        }
    }

    pub(crate) fn get(&self, k: &str) -> EagerGetState {
        match self.values.get(k) {
            Some(None) => EagerGetState::Default,
            Some(Some(v)) if v.is_empty() => EagerGetState::Default,
            Some(Some(v)) => EagerGetState::Value(v.clone()),
            None if self.complete => EagerGetState::Default,
            None => EagerGetState::Unknown,
        }
    }

    pub(crate) fn get_keys(&self) -> EagerGetStateKeys {
        if !self.complete {
            return EagerGetStateKeys::Unknown;
        }
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter_map(|(k, v)| v.is_some().then(|| k.clone()))
            .collect();
        keys.sort();
        EagerGetStateKeys::Keys(keys)
    }

    pub(crate) fn set(&mut self, k: String, v: Bytes) {
        self.values.insert(k, Some(v));
    }

    pub(crate) fn clear(&mut self, k: String) {
        self.values.insert(k, None);
    }

    pub(crate) fn clear_all(&mut self) {
        self.values.clear();
        self.complete = true;
    }

    /// Record a value learned from a supervisor completion.
    pub(crate) fn learn(&mut self, k: String, v: Option<Bytes>) {
        self.values.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let mut state = EagerState::default();
        state.set("k".to_owned(), Bytes::from_static(b"v"));
        assert!(matches!(state.get("k"), EagerGetState::Value(v) if v == Bytes::from_static(b"v")));
    }

    #[test]
    fn clear_without_set_yields_default() {
        let mut state = EagerState::new(false, vec![("k".to_owned(), Bytes::from_static(b"v"))]);
        state.clear("k".to_owned());
        assert!(matches!(state.get("k"), EagerGetState::Default));
    }

    #[test]
    fn clear_all_makes_every_key_default_until_set() {
        let mut state = EagerState::new(false, vec![("a".to_owned(), Bytes::from_static(b"1"))]);
        state.clear_all();
        assert!(matches!(state.get("a"), EagerGetState::Default));
        assert!(matches!(state.get("never-seen"), EagerGetState::Default));

        state.set("a".to_owned(), Bytes::from_static(b"2"));
        assert!(matches!(state.get("a"), EagerGetState::Value(v) if v == Bytes::from_static(b"2")));
    }

    #[test]
    fn partial_snapshot_leaves_absent_keys_unknown() {
        let state = EagerState::new(false, vec![]);
        assert!(matches!(state.get("k"), EagerGetState::Unknown));
        assert!(matches!(state.get_keys(), EagerGetStateKeys::Unknown));
    }

    #[test]
    fn complete_snapshot_answers_locally() {
        let state = EagerState::new(
            true,
            vec![
                ("b".to_owned(), Bytes::from_static(b"2")),
                ("a".to_owned(), Bytes::from_static(b"1")),
            ],
        );
        assert!(matches!(state.get("missing"), EagerGetState::Default));
        let EagerGetStateKeys::Keys(keys) = state.get_keys() else {
            panic!("expected local keys");
        };
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn empty_bytes_mean_default() {
        let mut state = EagerState::default();
        state.set("k".to_owned(), Bytes::new());
        assert!(matches!(state.get("k"), EagerGetState::Default));
    }
}
