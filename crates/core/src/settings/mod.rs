//! Live settings tree: global color controls plus one entry per LED group.
//!
//! Updates are partial JSON documents merged key by key into the current
//! tree. Every accepted update installs a fresh `Arc<Settings>` so the render
//! thread can hold a consistent snapshot for a whole cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::color::{blackbody_to_rgb, MAX_KELVIN, MIN_KELVIN};
use crate::{LedControlError, Result};

/// Key of the group that always exists.
pub const MAIN_GROUP: &str = "main";

/// Old top-level keys and the keys that replaced them.
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("master_brightness", "global_brightness"),
    ("brightness", "global_brightness"),
    ("master_saturation", "global_saturation"),
    ("saturation", "global_saturation"),
    ("master_color_temp", "global_color_temp"),
    ("color_temp", "global_color_temp"),
];

/// Where a group's pixels are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// The locally attached strip.
    #[default]
    Local,
    /// A controller on a serial port named by `render_target`.
    Serial,
    /// A controller reachable over UDP at `render_target`.
    Udp,
}

/// Accepts `true`/`false` as well as the `0`/`1` integers older save files
/// used for flags.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Float(f64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value != 0,
        Flag::Float(value) => value != 0.0,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub range_start: usize,
    /// Exclusive; may exceed the strip length.
    pub range_end: usize,
    pub render_mode: RenderMode,
    pub render_target: String,
    pub name: String,
    /// Pattern id.
    pub function: u32,
    pub speed: f64,
    pub scale: f64,
    /// Palette id.
    pub palette: u32,
    pub brightness: f64,
    pub saturation: f64,
    pub color_temp: f64,
    /// Take this range from the external frame buffer instead of a pattern.
    #[serde(deserialize_with = "flag")]
    pub external_source: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            range_start: 0,
            range_end: 100_000,
            render_mode: RenderMode::Local,
            render_target: String::new(),
            name: MAIN_GROUP.to_string(),
            function: 0,
            speed: 0.2,
            scale: 1.0,
            palette: 0,
            brightness: 1.0,
            saturation: 1.0,
            color_temp: 6500.0,
            external_source: false,
        }
    }
}

impl GroupSettings {
    fn routes_like(&self, other: &Self) -> bool {
        self.range_start == other.range_start
            && self.range_end == other.range_end
            && self.render_mode == other.render_mode
            && self.render_target == other.render_target
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(deserialize_with = "flag")]
    pub on: bool,
    pub global_brightness: f64,
    pub global_color_temp: f64,
    pub global_color_r: f64,
    pub global_color_g: f64,
    pub global_color_b: f64,
    pub global_saturation: f64,
    /// Show the external frame buffer on every group.
    #[serde(deserialize_with = "flag")]
    pub sacn: bool,
    /// Drive every group white so the color correction can be judged.
    #[serde(deserialize_with = "flag")]
    pub calibration: bool,
    pub groups: BTreeMap<String, GroupSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            on: true,
            global_brightness: 0.15,
            global_color_temp: 6500.0,
            global_color_r: 1.0,
            global_color_g: 1.0,
            global_color_b: 1.0,
            global_saturation: 1.0,
            sacn: false,
            calibration: false,
            groups: BTreeMap::from([(MAIN_GROUP.to_string(), GroupSettings::default())]),
        }
    }
}

impl Settings {
    /// Per-channel correction of a group: global color times the black body
    /// tints of the global and group color temperatures times the strip's
    /// fixed correction.
    pub fn correction(&self, group: &GroupSettings, strip_correction: [f64; 3]) -> [f64; 3] {
        let global_tint = blackbody_to_rgb(self.global_color_temp);
        let group_tint = blackbody_to_rgb(group.color_temp);
        let color = [self.global_color_r, self.global_color_g, self.global_color_b];
        [0, 1, 2].map(|i| color[i] * global_tint[i] * group_tint[i] * strip_correction[i])
    }

    /// Brightness actually applied to a group.
    pub fn effective_brightness(&self, group: &GroupSettings) -> f64 {
        if self.on {
            self.global_brightness * group.brightness
        } else {
            0.0
        }
    }

    pub fn effective_saturation(&self, group: &GroupSettings) -> f64 {
        self.global_saturation * group.saturation
    }

    /// Clamps every value into its valid range.
    pub fn sanitize(&mut self, brightness_limit: f64) {
        self.global_brightness = unit(self.global_brightness).min(brightness_limit);
        self.global_saturation = unit(self.global_saturation);
        self.global_color_r = unit(self.global_color_r);
        self.global_color_g = unit(self.global_color_g);
        self.global_color_b = unit(self.global_color_b);
        self.global_color_temp = kelvin(self.global_color_temp);
        self.groups
            .entry(MAIN_GROUP.to_string())
            .or_insert_with(GroupSettings::default);
        for group in self.groups.values_mut() {
            group.brightness = unit(group.brightness);
            group.saturation = unit(group.saturation);
            group.color_temp = kelvin(group.color_temp);
            if !group.speed.is_finite() {
                group.speed = 0.0;
            }
            if !group.scale.is_finite() {
                group.scale = 1.0;
            }
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn kelvin(value: f64) -> f64 {
    if value.is_nan() {
        6500.0
    } else {
        value.clamp(MIN_KELVIN, MAX_KELVIN)
    }
}

/// What a settings update invalidated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Anything at all differs.
    pub changed: bool,
    /// Groups whose pattern assignment changed.
    pub repatterned: BTreeSet<String>,
    /// A range or output route changed or disappeared; stale pixels must be
    /// cleared once.
    pub clear_leds: bool,
}

impl ChangeSet {
    pub fn between(old: &Settings, new: &Settings) -> Self {
        let mut changes = ChangeSet {
            changed: old != new,
            ..ChangeSet::default()
        };

        for (key, group) in &new.groups {
            match old.groups.get(key) {
                None => {
                    changes.repatterned.insert(key.clone());
                    changes.clear_leds = true;
                }
                Some(prev) => {
                    if prev.function != group.function {
                        changes.repatterned.insert(key.clone());
                    }
                    if !prev.routes_like(group) {
                        changes.clear_leds = true;
                    }
                }
            }
        }
        if old.groups.keys().any(|key| !new.groups.contains_key(key)) {
            changes.clear_leds = true;
        }
        changes
    }
}

/// Recursive key-wise merge of `patch` into `target`.
///
/// Objects are merged; every other value replaces what was there.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Renames the top-level keys older clients and save files still send.
pub fn normalize_legacy_keys(update: &mut Value) {
    let Value::Object(map) = update else {
        return;
    };
    for (old, new) in LEGACY_KEYS {
        if let Some(value) = map.remove(*old) {
            if !map.contains_key(*new) {
                map.insert((*new).to_string(), value);
            }
        }
    }
}

/// Thread-safe owner of the live [`Settings`].
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
    version: AtomicU64,
    brightness_limit: f64,
}

impl SettingsStore {
    pub fn new(mut settings: Settings, brightness_limit: f64) -> Self {
        settings.sanitize(brightness_limit);
        Self {
            current: RwLock::new(Arc::new(settings)),
            version: AtomicU64::new(0),
            brightness_limit,
        }
    }

    pub fn snapshot(&self) -> Result<Arc<Settings>> {
        Ok(Arc::clone(&*self.read()?))
    }

    /// Bumped on every accepted change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Merges a partial settings document into the live tree.
    ///
    /// Brightness is capped at the configured limit, and supplying a nonzero
    /// global brightness switches the strip on. A rejected update leaves the
    /// tree untouched.
    pub fn update(&self, partial: &Value) -> Result<ChangeSet> {
        if !partial.is_object() {
            return Err(LedControlError::msg("settings update must be a JSON object"));
        }
        let mut partial = partial.clone();
        normalize_legacy_keys(&mut partial);
        let turns_on = partial
            .get("global_brightness")
            .and_then(Value::as_f64)
            .is_some_and(|value| value > 0.0);

        let mut current = self.write()?;
        let mut merged = serde_json::to_value(&**current)?;
        deep_merge(&mut merged, &partial);
        let mut next: Settings = serde_json::from_value(merged)?;
        next.sanitize(self.brightness_limit);
        if turns_on && next.global_brightness > 0.0 {
            next.on = true;
        }

        let changes = ChangeSet::between(&current, &next);
        if changes.changed {
            *current = Arc::new(next);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        Ok(changes)
    }

    /// Replaces the whole tree, e.g. when restoring saved state.
    pub fn replace(&self, mut settings: Settings) -> Result<ChangeSet> {
        settings.sanitize(self.brightness_limit);
        let mut current = self.write()?;
        let changes = ChangeSet::between(&current, &settings);
        *current = Arc::new(settings);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(changes)
    }

    pub fn remove_group(&self, key: &str) -> Result<()> {
        if key == MAIN_GROUP {
            return Err(LedControlError::GroupNotRemovable(key.to_string()));
        }
        let mut current = self.write()?;
        if !current.groups.contains_key(key) {
            return Err(LedControlError::UnknownGroup(key.to_string()));
        }
        let mut next = Settings::clone(&current);
        next.groups.remove(key);
        *current = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Arc<Settings>>> {
        self.current
            .read()
            .map_err(|_| LedControlError::Poisoned("settings"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Arc<Settings>>> {
        self.current
            .write()
            .map_err(|_| LedControlError::Poisoned("settings"))
    }
}
