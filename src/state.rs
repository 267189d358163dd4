//! Two-layer key/value state with scope prefixes.
//!
//! Keys are partitioned by prefix:
//! - `app:`  shared by every session of an app
//! - `user:` shared by every session of one user within an app
//! - `temp:` scoped to the current invocation, never persisted
//! - no prefix: scoped to a single session

use serde_json::Value;

/// Ordered JSON object used for state values and deltas.
pub type StateMap = serde_json::Map<String, Value>;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";
pub const TEMP_PREFIX: &str = "temp:";

/// Storage scope a state key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateScope {
    App,
    User,
    Session,
    Temp,
}

impl StateScope {
    /// Classify a key, returning its scope and the key with the prefix removed.
    pub fn of(key: &str) -> (Self, &str) {
        if let Some(rest) = key.strip_prefix(APP_PREFIX) {
            (Self::App, rest)
        } else if let Some(rest) = key.strip_prefix(USER_PREFIX) {
            (Self::User, rest)
        } else if let Some(rest) = key.strip_prefix(TEMP_PREFIX) {
            (Self::Temp, rest)
        } else {
            (Self::Session, key)
        }
    }
}

/// A state delta split by storage scope. App and user keys are unprefixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedDelta {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

impl ScopedDelta {
    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty()
    }
}

/// Route every key of `delta` to exactly one store; `temp:` keys are dropped.
pub fn split_state_delta(delta: &StateMap) -> ScopedDelta {
    let mut scoped = ScopedDelta::default();
    for (key, value) in delta {
        match StateScope::of(key) {
            (StateScope::App, rest) => {
                scoped.app.insert(rest.to_string(), value.clone());
            }
            (StateScope::User, rest) => {
                scoped.user.insert(rest.to_string(), value.clone());
            }
            (StateScope::Session, _) => {
                scoped.session.insert(key.clone(), value.clone());
            }
            (StateScope::Temp, _) => {}
        }
    }
    scoped
}

/// Remove `temp:` keys from a delta in place.
pub fn strip_temp_keys(delta: &mut StateMap) {
    delta.retain(|key, _| !key.starts_with(TEMP_PREFIX));
}

/// Materialize the state a session sees: session keys overlaid with
/// re-prefixed user and app keys.
pub fn merge_scoped_state(session: &StateMap, user: &StateMap, app: &StateMap) -> StateMap {
    let mut merged = session.clone();
    for (key, value) in user {
        merged.insert(format!("{USER_PREFIX}{key}"), value.clone());
    }
    for (key, value) in app {
        merged.insert(format!("{APP_PREFIX}{key}"), value.clone());
    }
    merged
}

/// Committed value plus the pending delta of the current callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    value: StateMap,
    delta: StateMap,
}

impl State {
    pub fn new(value: StateMap, delta: StateMap) -> Self {
        Self { value, delta }
    }

    /// Read a key, preferring the pending delta.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.delta.get(key).or_else(|| self.value.get(key))
    }

    /// Deserialize a key into `T`, ignoring values of the wrong shape.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.value.insert(key.clone(), value.clone());
        self.delta.insert(key, value);
    }

    pub fn update(&mut self, delta: StateMap) {
        for (key, value) in delta {
            self.set(key, value);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.delta.contains_key(key) || self.value.contains_key(key)
    }

    pub fn has_delta(&self) -> bool {
        !self.delta.is_empty()
    }

    pub fn delta(&self) -> &StateMap {
        &self.delta
    }

    pub fn take_delta(&mut self) -> StateMap {
        std::mem::take(&mut self.delta)
    }

    /// Flattened view of value and delta.
    pub fn to_map(&self) -> StateMap {
        let mut merged = self.value.clone();
        for (key, value) in &self.delta {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> StateMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn delta_wins_over_value() {
        let state = State::new(map(json!({"k": 1})), map(json!({"k": 2})));
        assert_eq!(state.get("k"), Some(&json!(2)));
    }

    #[test]
    fn set_writes_both_layers() {
        let mut state = State::new(map(json!({"k": 1})), StateMap::new());
        state.set("n", json!("v"));
        assert!(state.has_delta());
        assert_eq!(state.delta().get("n"), Some(&json!("v")));
        assert_eq!(state.to_map().get("n"), Some(&json!("v")));
        assert_eq!(state.to_map().get("k"), Some(&json!(1)));
    }

    #[test]
    fn split_routes_each_key_once_and_drops_temp() {
        let scoped = split_state_delta(&map(json!({
            "app:x": 1,
            "user:y": 2,
            "z": 3,
            "temp:scratch": 4,
        })));
        assert_eq!(scoped.app, map(json!({"x": 1})));
        assert_eq!(scoped.user, map(json!({"y": 2})));
        assert_eq!(scoped.session, map(json!({"z": 3})));
    }

    #[test]
    fn merged_state_reprefixes_shared_scopes() {
        let merged = merge_scoped_state(
            &map(json!({"z": 3, "app:x": "shadowed"})),
            &map(json!({"y": 2})),
            &map(json!({"x": 1})),
        );
        assert_eq!(merged, map(json!({"z": 3, "user:y": 2, "app:x": 1})));
    }

    #[test]
    fn strip_temp_keys_keeps_everything_else() {
        let mut delta = map(json!({"temp:a": 1, "b": 2, "app:c": 3}));
        strip_temp_keys(&mut delta);
        assert_eq!(delta, map(json!({"b": 2, "app:c": 3})));
    }
}
