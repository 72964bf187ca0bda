//! The save file: settings, presets, user patterns and palettes as JSON.
//!
//! Loading never fails on bad content. Each section, and each pattern,
//! palette, preset and group inside it, is read on its own; whatever cannot be
//! read is dropped and the file is copied aside. Files written before
//! `save_version` existed are upgraded after a backup copy is made.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::palette::Palette;
use crate::pattern::PatternDefinition;
use crate::settings::{normalize_legacy_keys, Settings};
use crate::{LedControlError, Result};

/// Version written by [`SaveFile::save`].
pub const SAVE_VERSION: u32 = 2;

fn default_speed() -> f64 {
    0.2
}

fn default_scale() -> f64 {
    1.0
}

/// A pattern as stored on disk.
///
/// Built-in patterns only carry their adjustable metadata; their source
/// always comes from the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "default", default)]
    pub is_default: bool,
    #[serde(alias = "primary_speed", default = "default_speed")]
    pub default_speed: f64,
    #[serde(alias = "primary_scale", default = "default_scale")]
    pub default_scale: f64,
}

impl SavedFunction {
    pub fn from_definition(definition: &PatternDefinition) -> Self {
        let (name, source) = if definition.is_default {
            (None, None)
        } else {
            (
                Some(definition.name.clone()),
                Some(definition.source.clone()),
            )
        };
        Self {
            name,
            source,
            is_default: definition.is_default,
            default_speed: definition.default_speed,
            default_scale: definition.default_scale,
        }
    }

    /// Definition of a user pattern; `id` names it when the file does not.
    pub fn into_definition(self, id: u32) -> PatternDefinition {
        PatternDefinition {
            default_speed: self.default_speed,
            default_scale: self.default_scale,
            ..PatternDefinition::new(
                self.name.unwrap_or_else(|| format!("Pattern {id}")),
                self.source.unwrap_or_default(),
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    pub save_version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub presets: BTreeMap<String, Value>,
    #[serde(default)]
    pub functions: BTreeMap<u32, SavedFunction>,
    #[serde(default)]
    pub palettes: BTreeMap<u32, Palette>,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            save_version: SAVE_VERSION,
            settings: Settings::default(),
            presets: BTreeMap::new(),
            functions: BTreeMap::new(),
            palettes: BTreeMap::new(),
        }
    }
}

/// Result of [`SavedState::parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedState {
    pub state: SavedState,
    /// The text was a version 1 document.
    pub upgraded: bool,
    /// Dotted paths of the parts that could not be read, e.g.
    /// `palettes.12` or `settings.groups.left`.
    pub skipped: Vec<String>,
}

impl SavedState {
    /// Parses save file text, upgrading files without a `save_version`.
    ///
    /// Only text that is not a JSON object at all is an error. Calibration is
    /// always off in the result.
    pub fn parse(text: &str) -> Result<ParsedState> {
        let mut value: Value = serde_json::from_str(text)?;
        let upgraded = value.get("save_version").is_none();
        if upgraded {
            value = upgrade_v1(value)?;
        }
        let Value::Object(mut document) = value else {
            return Err(LedControlError::Persistence(
                "save file is not a JSON object".to_string(),
            ));
        };

        let mut skipped = Vec::new();
        let settings = match document.remove("settings") {
            Some(mut settings) => {
                normalize_legacy_keys(&mut settings);
                parse_settings(settings, &mut skipped)
            }
            None => Settings::default(),
        };
        let mut state = SavedState {
            save_version: SAVE_VERSION,
            settings,
            presets: parse_entries(document.remove("presets"), "presets", &mut skipped),
            functions: parse_entries(document.remove("functions"), "functions", &mut skipped),
            palettes: parse_entries(document.remove("palettes"), "palettes", &mut skipped),
        };
        state.settings.calibration = false;
        Ok(ParsedState {
            state,
            upgraded,
            skipped,
        })
    }
}

fn skip(skipped: &mut Vec<String>, path: String, error: &dyn std::fmt::Display) {
    tracing::warn!(path = path.as_str(), error = %error, "unreadable saved entry dropped");
    skipped.push(path);
}

/// Reads every entry of a keyed section on its own.
fn parse_entries<K, T>(section: Option<Value>, name: &str, skipped: &mut Vec<String>) -> BTreeMap<K, T>
where
    K: std::str::FromStr + Ord,
    K::Err: std::fmt::Display,
    T: DeserializeOwned,
{
    let mut entries = BTreeMap::new();
    let map = match section {
        None | Some(Value::Null) => return entries,
        Some(Value::Object(map)) => map,
        Some(other) => {
            skip(skipped, name.to_string(), &format!("expected an object, found {other}"));
            return entries;
        }
    };
    for (key, value) in map {
        let path = format!("{name}.{key}");
        let id = match key.parse::<K>() {
            Ok(id) => id,
            Err(err) => {
                skip(skipped, path, &err);
                continue;
            }
        };
        match serde_json::from_value(value) {
            Ok(entry) => {
                entries.insert(id, entry);
            }
            Err(err) => skip(skipped, path, &err),
        }
    }
    entries
}

/// Reads the settings section, keeping every top-level key and group that
/// deserializes when added to the ones accepted before it.
fn parse_settings(section: Value, skipped: &mut Vec<String>) -> Settings {
    if let Ok(settings) = serde_json::from_value(section.clone()) {
        return settings;
    }
    let Value::Object(map) = section else {
        skip(skipped, "settings".to_string(), &"expected an object");
        return Settings::default();
    };

    let accepts = |candidate: &Map<String, Value>| {
        serde_json::from_value::<Settings>(Value::Object(candidate.clone()))
    };
    let mut accepted = Map::new();
    for (key, value) in map {
        match value {
            Value::Object(groups) if key == "groups" => {
                accepted.insert(key.clone(), Value::Object(Map::new()));
                for (group, settings) in groups {
                    let mut candidate = accepted.clone();
                    if let Some(Value::Object(groups)) = candidate.get_mut("groups") {
                        groups.insert(group.clone(), settings);
                    }
                    match accepts(&candidate) {
                        Ok(_) => accepted = candidate,
                        Err(err) => skip(skipped, format!("settings.groups.{group}"), &err),
                    }
                }
            }
            value => {
                let mut candidate = accepted.clone();
                candidate.insert(key.clone(), value);
                match accepts(&candidate) {
                    Ok(_) => accepted = candidate,
                    Err(err) => skip(skipped, format!("settings.{key}"), &err),
                }
            }
        }
    }
    accepts(&accepted).unwrap_or_default()
}

/// Converts a version 1 document: `params` become the settings of a single
/// `main` group, `patterns` become `functions`.
fn upgrade_v1(mut value: Value) -> Result<Value> {
    let document = value
        .as_object_mut()
        .ok_or_else(|| LedControlError::Persistence("save file is not a JSON object".to_string()))?;
    let params = document
        .remove("params")
        .ok_or_else(|| LedControlError::Persistence("save file has no `params`".to_string()))?;
    let param = |keys: &[&str], fallback: f64| {
        keys.iter()
            .find_map(|key| params.get(*key).and_then(Value::as_f64))
            .unwrap_or(fallback)
    };

    let settings = json!({
        "global_brightness": param(&["brightness", "master_brightness"], 0.15),
        "global_color_temp": param(&["color_temp", "master_color_temp"], 6500.0),
        "global_color_r": 1.0,
        "global_color_g": 1.0,
        "global_color_b": 1.0,
        "global_saturation": param(&["saturation", "master_saturation"], 1.0),
        "groups": {
            "main": {
                "range_start": 0,
                "range_end": 100_000,
                "render_mode": "local",
                "render_target": "",
                "name": "main",
                "brightness": 1.0,
                "color_temp": 6500.0,
                "saturation": 1.0,
                "function": 0,
                "speed": param(&["primary_speed"], 0.2),
                "scale": param(&["primary_scale"], 1.0),
                "palette": 0,
            }
        }
    });

    let mut functions = document
        .remove("patterns")
        .unwrap_or_else(|| json!({}));
    if let Some(functions) = functions.as_object_mut() {
        for function in functions.values_mut().filter_map(Value::as_object_mut) {
            let is_default = !function.contains_key("source");
            function.insert("default".to_string(), Value::Bool(is_default));
        }
    }
    if let Some(palettes) = document.get_mut("palettes").and_then(Value::as_object_mut) {
        for palette in palettes.values_mut().filter_map(Value::as_object_mut) {
            palette.insert("default".to_string(), Value::Bool(false));
        }
    }

    document.insert("settings".to_string(), settings);
    document.insert("functions".to_string(), functions);
    document.insert("save_version".to_string(), json!(SAVE_VERSION));
    Ok(value)
}

/// Location of the save file on disk.
#[derive(Debug, Clone)]
pub struct SaveFile {
    path: PathBuf,
}

impl SaveFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<name>.json.bak`, written before an upgrade.
    pub fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.bak")
    }

    /// `<name>.json.error`, written when the file cannot be used.
    pub fn error_path(&self) -> PathBuf {
        self.path.with_extension("json.error")
    }

    /// Reads the save file, creating an empty one when it is missing.
    ///
    /// Only I/O failures are errors. Content that cannot be read at all
    /// yields defaults; unreadable entries are dropped one by one. Either way
    /// the file is first copied to [`Self::error_path`].
    pub fn load(&self) -> Result<SavedState> {
        if !self.path.exists() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.path, "")?;
        }
        let bytes = fs::read(&self.path)?;
        let text = String::from_utf8_lossy(&bytes);
        if text.trim().is_empty() {
            tracing::info!(path = %self.path.display(), "creating new settings file");
            return Ok(SavedState::default());
        }

        let parsed = match serde_json::from_str::<Value>(&text) {
            Ok(value) if value.get("save_version").is_none() => {
                tracing::warn!(
                    path = %self.path.display(),
                    backup = %self.backup_path().display(),
                    "old save file version, making a backup before upgrading"
                );
                fs::copy(&self.path, self.backup_path())?;
                SavedState::parse(&text)
            }
            _ => SavedState::parse(&text),
        };

        match parsed {
            Ok(parsed) => {
                if !parsed.skipped.is_empty() {
                    tracing::warn!(
                        path = %self.path.display(),
                        backup = %self.error_path().display(),
                        skipped = ?parsed.skipped,
                        "some saved entries are invalid, backing up and dropping them"
                    );
                    fs::copy(&self.path, self.error_path())?;
                }
                if parsed.upgraded {
                    tracing::info!(path = %self.path.display(), "upgraded save file");
                }
                tracing::info!(path = %self.path.display(), "loaded saved settings");
                Ok(parsed.state)
            }
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    backup = %self.error_path().display(),
                    error = %err,
                    "saved settings are invalid, backing up and using defaults"
                );
                fs::copy(&self.path, self.error_path())?;
                Ok(SavedState::default())
            }
        }
    }

    /// Writes `state` as pretty JSON.
    pub fn save(&self, state: &SavedState) -> Result<()> {
        let text = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, text)?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MAIN_GROUP;

    #[test]
    fn built_in_functions_keep_only_metadata() {
        let mut definition = PatternDefinition::new("Hue Cycle 1D", "hsv(t + x, 1.0, 1.0)");
        definition.is_default = true;
        definition.default_speed = 0.5;
        let saved = SavedFunction::from_definition(&definition);
        let json = serde_json::to_value(&saved).unwrap();
        assert_eq!(json, json!({ "default": true, "default_speed": 0.5, "default_scale": 1.0 }));
    }

    #[test]
    fn user_functions_round_trip_through_definitions() {
        let saved: SavedFunction = serde_json::from_value(json!({
            "name": "Mine",
            "source": "palette(x)",
            "default": false,
            "primary_speed": 0.5,
        }))
        .unwrap();
        let definition = saved.into_definition(7);
        assert_eq!(definition.name, "Mine");
        assert_eq!(definition.source, "palette(x)");
        assert_eq!(definition.default_speed, 0.5);
        assert_eq!(definition.default_scale, 1.0);
        assert!(!definition.is_default);
    }

    #[test]
    fn version_one_documents_are_upgraded() {
        let text = json!({
            "params": {
                "master_brightness": 0.5,
                "color_temp": 3000,
                "saturation": 0.75,
                "primary_speed": 0.25,
                "primary_scale": 2.0,
            },
            "patterns": {
                "5": { "primary_speed": 0.5, "primary_scale": 1.0 },
                "1000": { "name": "Mine", "source": "palette(x)", "primary_speed": 0.5, "primary_scale": 1.0 },
            },
            "palettes": {
                "10": { "name": "Custom", "colors": [[0.0, 1.0, 1.0], [0.5, 1.0, 1.0]] },
            },
        })
        .to_string();

        let parsed = SavedState::parse(&text).unwrap();
        assert!(parsed.upgraded);
        assert!(parsed.skipped.is_empty());
        let state = parsed.state;
        assert_eq!(state.save_version, SAVE_VERSION);
        assert_eq!(state.settings.global_brightness, 0.5);
        assert_eq!(state.settings.global_color_temp, 3000.0);
        assert_eq!(state.settings.global_saturation, 0.75);
        let main = &state.settings.groups[MAIN_GROUP];
        assert_eq!(main.speed, 0.25);
        assert_eq!(main.scale, 2.0);
        assert!(state.functions[&5].is_default);
        assert!(!state.functions[&1000].is_default);
        assert_eq!(state.functions[&1000].source.as_deref(), Some("palette(x)"));
        assert!(!state.palettes[&10].is_default);
    }

    #[test]
    fn calibration_is_forced_off_and_legacy_keys_renamed() {
        let text = json!({
            "save_version": 2,
            "settings": { "calibration": 1, "master_brightness": 0.5 },
        })
        .to_string();
        let parsed = SavedState::parse(&text).unwrap();
        assert!(!parsed.upgraded);
        assert!(!parsed.state.settings.calibration);
        assert_eq!(parsed.state.settings.global_brightness, 0.5);
    }

    #[test]
    fn bad_entries_are_dropped_one_by_one() {
        let text = json!({
            "save_version": 2,
            "settings": {
                "global_brightness": 0.42,
                "global_saturation": "vivid",
                "groups": {
                    "main": { "function": 310 },
                    "left": { "range_start": "far" },
                },
            },
            "presets": { "dim": { "global_brightness": 0.1 } },
            "functions": {
                "1000": { "name": "Mine", "source": "palette(x)" },
                "1001": { "name": 5 },
                "abc": { "name": "Bad id", "source": "palette(x)" },
            },
            "palettes": {
                "10": { "name": "Good", "colors": [[0.0, 1.0, 1.0], [0.5, 1.0, 1.0]] },
                "11": { "name": "Bad", "colors": "oops" },
            },
        })
        .to_string();

        let parsed = SavedState::parse(&text).unwrap();
        let state = parsed.state;
        assert_eq!(state.settings.global_brightness, 0.42);
        assert_eq!(state.settings.global_saturation, 1.0);
        assert_eq!(state.settings.groups[MAIN_GROUP].function, 310);
        assert!(!state.settings.groups.contains_key("left"));
        assert_eq!(state.presets.len(), 1);
        assert_eq!(state.functions.keys().collect::<Vec<_>>(), vec![&1000]);
        assert_eq!(state.palettes.keys().collect::<Vec<_>>(), vec![&10]);

        let mut skipped = parsed.skipped;
        skipped.sort();
        assert_eq!(
            skipped,
            vec![
                "functions.1001",
                "functions.abc",
                "palettes.11",
                "settings.global_saturation",
                "settings.groups.left",
            ]
        );
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(SavedState::parse("[1, 2]").is_err());
        assert!(SavedState::parse(r#"{ "save_version": 2, "palettes": [] }"#)
            .unwrap()
            .skipped
            .contains(&"palettes".to_string()));
    }

    #[test]
    fn version_one_without_params_is_rejected() {
        assert!(SavedState::parse(r#"{ "patterns": {} }"#).is_err());
    }
}
