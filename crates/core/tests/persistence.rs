use std::fs;

use ledcontrol_core::persist::SAVE_VERSION;
use ledcontrol_core::{AnimationEngine, EngineConfig, Palette, PatternDefinition, SaveFile};
use serde_json::json;
use tempfile::tempdir;

fn engine() -> AnimationEngine {
    AnimationEngine::new(EngineConfig::with_led_count(10)).unwrap()
}

#[test]
fn missing_file_is_created_with_defaults() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));
    let state = file.load().unwrap();
    assert_eq!(state.save_version, SAVE_VERSION);
    assert!(file.path().exists());
    assert!(!file.error_path().exists());
}

#[test]
fn engine_state_survives_a_save_and_load() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));

    let original = engine();
    original
        .update_settings(&json!({
            "global_brightness": 0.5,
            "groups": { "main": { "function": 2000, "speed": 0.25 } },
        }))
        .unwrap();
    original
        .update_function(2000, PatternDefinition::new("Mine", "palette(x + t)"))
        .unwrap();
    original
        .update_palette(20, Palette::new("Custom", vec![[0.0, 1.0, 1.0], [0.5, 1.0, 0.5]]))
        .unwrap();
    original.update_preset("dim", json!({ "global_brightness": 0.25 })).unwrap();
    file.save(&original.snapshot_state().unwrap()).unwrap();

    let restored = engine();
    let reports = restored.restore_state(file.load().unwrap()).unwrap();
    assert!(reports[&2000].errors.is_empty());

    let settings = restored.get_settings().unwrap();
    assert_eq!(settings.global_brightness, 0.5);
    assert_eq!(settings.groups["main"].function, 2000);
    assert_eq!(settings.groups["main"].speed, 0.25);
    let functions = restored.get_functions().unwrap();
    assert_eq!(functions[&2000].source, "palette(x + t)");
    assert!(!functions[&2000].is_default);
    assert!(functions[&0].is_default);
    assert_eq!(restored.get_palettes().unwrap()[&20].name, "Custom");
    assert_eq!(restored.get_presets().unwrap()["dim"], json!({ "global_brightness": 0.25 }));
}

#[test]
fn saved_built_ins_only_carry_metadata() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));
    file.save(&engine().snapshot_state().unwrap()).unwrap();

    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(file.path()).unwrap()).unwrap();
    let static_color = &saved["functions"]["0"];
    assert_eq!(static_color["default"], json!(true));
    assert!(static_color.get("source").is_none());
    assert!(saved["palettes"].as_object().unwrap().is_empty());
}

#[test]
fn version_one_files_are_backed_up_and_upgraded() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));
    let original = json!({
        "params": { "brightness": 0.5, "color_temp": 5000, "saturation": 1.0,
                    "primary_speed": 0.5, "primary_scale": 2.0 },
        "patterns": { "310": { "primary_speed": 0.5, "primary_scale": 1.0 } },
        "palettes": {},
    })
    .to_string();
    fs::write(file.path(), &original).unwrap();

    let state = file.load().unwrap();
    assert_eq!(fs::read_to_string(file.backup_path()).unwrap(), original);
    assert_eq!(state.settings.global_brightness, 0.5);
    assert_eq!(state.settings.groups["main"].scale, 2.0);

    let engine = engine();
    engine.restore_state(state).unwrap();
    assert_eq!(engine.get_functions().unwrap()[&310].default_speed, 0.5);
}

#[test]
fn unreadable_files_fall_back_to_defaults() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));
    fs::write(file.path(), "{ not json").unwrap();

    let state = file.load().unwrap();
    assert_eq!(state.settings, Default::default());
    assert_eq!(fs::read_to_string(file.error_path()).unwrap(), "{ not json");
}

#[test]
fn one_bad_palette_does_not_discard_the_rest() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));
    let text = json!({
        "save_version": 2,
        "settings": { "global_brightness": 0.42 },
        "presets": { "dim": { "global_brightness": 0.25 } },
        "palettes": { "20": { "name": "Broken", "colors": "oops" } },
    })
    .to_string();
    fs::write(file.path(), &text).unwrap();

    let state = file.load().unwrap();
    assert_eq!(state.settings.global_brightness, 0.42);
    assert_eq!(state.presets.len(), 1);
    assert!(state.palettes.is_empty());
    assert_eq!(fs::read_to_string(file.error_path()).unwrap(), text);

    let engine = engine();
    engine.restore_state(state).unwrap();
    assert_eq!(engine.get_settings().unwrap().global_brightness, 0.42);
}

#[test]
fn startup_never_restores_calibration() {
    let dir = tempdir().unwrap();
    let file = SaveFile::new(dir.path().join("ledcontrol.json"));
    fs::write(
        file.path(),
        json!({ "save_version": 2, "settings": { "calibration": true } }).to_string(),
    )
    .unwrap();
    assert!(!file.load().unwrap().settings.calibration);
}
