//! Adapter options and key selection

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::storage::KeySelector;

/// Name of the area used when none is configured
pub const DEFAULT_AREA: &str = "sync";

/// Which keys a store group serves
///
/// Deserializes from the JSON shapes `null`, `"key"`, `["a", "b"]` and
/// `{"a": default, ...}`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(untagged)]
pub enum KeySelection {
    /// Any key of the area (dynamic store group)
    #[default]
    All,
    /// A single key
    One(String),
    /// A list of keys
    Many(Vec<String>),
    /// Keys with the values their stores hold until storage has one, in
    /// declaration order
    WithDefaults(Map<String, Value>),
}

/// Declared keys and their defaults, for a fixed store group
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeclaredKeys {
    /// Keys in declaration order, without duplicates
    pub keys: Vec<String>,
    pub defaults: BTreeMap<String, Value>,
}

impl KeySelection {
    /// Whether this selects the whole area
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Declared keys and defaults, `None` for `All`
    #[must_use]
    pub fn declared(&self) -> Option<DeclaredKeys> {
        let (keys, defaults): (Vec<String>, BTreeMap<String, Value>) = match self {
            Self::All => return None,
            Self::One(key) => (vec![key.clone()], BTreeMap::new()),
            Self::Many(keys) => (keys.clone(), BTreeMap::new()),
            Self::WithDefaults(defaults) => (
                defaults.keys().cloned().collect(),
                defaults.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
        };
        let mut seen = HashSet::new();
        let keys = keys.into_iter().filter(|key| seen.insert(key.clone())).collect();
        Some(DeclaredKeys { keys, defaults })
    }

    /// Selector for the initial bulk read
    #[must_use]
    pub fn selector(&self) -> KeySelector {
        match self.declared() {
            None => KeySelector::All,
            Some(declared) => KeySelector::Many(declared.keys),
        }
    }
}

impl From<&str> for KeySelection {
    fn from(key: &str) -> Self {
        Self::One(key.to_string())
    }
}

impl From<String> for KeySelection {
    fn from(key: String) -> Self {
        Self::One(key)
    }
}

impl From<Vec<String>> for KeySelection {
    fn from(keys: Vec<String>) -> Self {
        Self::Many(keys)
    }
}

impl From<Vec<&str>> for KeySelection {
    fn from(keys: Vec<&str>) -> Self {
        Self::Many(keys.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for KeySelection {
    fn from(keys: &[&str]) -> Self {
        Self::Many(keys.iter().map(|key| (*key).to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for KeySelection {
    fn from(keys: [&str; N]) -> Self {
        Self::from(keys.as_slice())
    }
}

impl From<Map<String, Value>> for KeySelection {
    fn from(defaults: Map<String, Value>) -> Self {
        Self::WithDefaults(defaults)
    }
}

impl From<BTreeMap<String, Value>> for KeySelection {
    fn from(defaults: BTreeMap<String, Value>) -> Self {
        Self::WithDefaults(defaults.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, Value); N]> for KeySelection {
    fn from(defaults: [(&str, Value); N]) -> Self {
        Self::WithDefaults(
            defaults
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }
}

/// Adapter options, as read from a configuration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Storage area name within the namespace
    pub area: String,
    /// Whether stores follow changes made elsewhere
    pub live: bool,
    pub keys: KeySelection,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            area: DEFAULT_AREA.to_string(),
            live: true,
            keys: KeySelection::All,
        }
    }
}

impl AdapterConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    /// Returns the parse error for malformed JSON or unknown fields.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_selection_json_shapes() {
        let parse = |text: &str| serde_json::from_str::<KeySelection>(text).unwrap();

        assert_eq!(parse("null"), KeySelection::All);
        assert_eq!(parse(r#""count""#), KeySelection::from("count"));
        assert_eq!(parse(r#"["a","b"]"#), KeySelection::from(["a", "b"]));
        assert_eq!(
            parse(r#"{"count": 0}"#),
            KeySelection::from([("count", json!(0))])
        );
    }

    #[test]
    fn test_declared_drops_duplicates() {
        let declared = KeySelection::from(["a", "b", "a"]).declared().unwrap();
        assert_eq!(declared.keys, vec!["a".to_string(), "b".to_string()]);
        assert!(declared.defaults.is_empty());
        assert!(KeySelection::All.declared().is_none());
    }

    #[test]
    fn test_selector() {
        assert_eq!(KeySelection::All.selector(), KeySelector::All);
        assert_eq!(
            KeySelection::from("k").selector(),
            KeySelector::Many(vec!["k".to_string()])
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = AdapterConfig::from_json("{}").unwrap();
        assert_eq!(config, AdapterConfig::default());
        assert_eq!(config.area, "sync");
        assert!(config.live);
        assert!(config.keys.is_dynamic());
    }

    #[test]
    fn test_config_full() {
        let config =
            AdapterConfig::from_json(r#"{"area": "local", "live": false, "keys": {"theme": "dark"}}"#)
                .unwrap();
        assert_eq!(config.area, "local");
        assert!(!config.live);
        assert_eq!(
            config.keys.declared().unwrap().defaults["theme"],
            json!("dark")
        );
    }

    #[test]
    fn test_defaults_keep_declaration_order() {
        let config =
            AdapterConfig::from_json(r#"{"keys": {"theme": "light", "size": 12, "accent": null}}"#)
                .unwrap();
        let declared = config.keys.declared().unwrap();
        assert_eq!(declared.keys, vec!["theme", "size", "accent"]);
        assert_eq!(declared.defaults["accent"], Value::Null);

        let declared = KeySelection::from([("z", json!(1)), ("a", json!(2))])
            .declared()
            .unwrap();
        assert_eq!(declared.keys, vec!["z", "a"]);
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        assert!(AdapterConfig::from_json(r#"{"storage": "sync"}"#).is_err());
    }
}
