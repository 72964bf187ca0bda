use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ledcontrol_core::palette::default_palettes;
use ledcontrol_core::pattern::{Compiled, Diagnostics, EvaluationError};
use ledcontrol_core::{
    AnimationEngine, ColorMode, EngineConfig, LocalFrameBuffer, PaletteTable, Pattern,
    PatternArgs, PatternCompiler, PatternDefinition, PatternOutput, PatternRegistry, PixelState,
    ScriptCompiler,
};
use serde_json::json;

fn engine(config: EngineConfig) -> AnimationEngine {
    AnimationEngine::new(config).unwrap()
}

fn use_pattern(engine: &AnimationEngine, id: u32, source: &str) {
    let report = engine
        .update_function(id, PatternDefinition::new(format!("test {id}"), source))
        .unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    engine
        .update_settings(&json!({ "groups": { "main": { "function": id } } }))
        .unwrap();
}

#[test]
fn palette_gradient_spans_the_strip() {
    let engine = engine(EngineConfig::with_led_count(100));
    use_pattern(&engine, 1000, "palette(x)");

    let mut sink = LocalFrameBuffer::new(100);
    engine.render_frame(&mut sink).unwrap();
    let hue = sink.input()[50][0];
    assert!((hue - 0.5).abs() <= 1.0 / 1000.0, "hue {hue}");
    assert_eq!(sink.modes()[50], ColorMode::Hsv);
}

#[test]
fn zero_scale_renders_every_led_alike() {
    let engine = engine(EngineConfig::with_led_count(16));
    use_pattern(&engine, 1001, "hsv(x, 1.0, 1.0)");
    engine
        .update_settings(&json!({ "groups": { "main": { "scale": 0.0 } } }))
        .unwrap();

    let mut sink = LocalFrameBuffer::new(16);
    engine.render_frame(&mut sink).unwrap();
    let first = sink.input()[0];
    assert!(sink.input().iter().all(|c| *c == first));
    assert_eq!(first, [0.0, 1.0, 1.0]);
}

#[test]
fn syntax_errors_leave_a_black_group() {
    let engine = engine(EngineConfig::with_led_count(8));
    let report = engine
        .update_function(1002, PatternDefinition::new("broken", "hsv(x, 1.0"))
        .unwrap();
    assert!(!report.errors.is_empty());
    assert!(!report.installed);
    engine
        .update_settings(&json!({ "groups": { "main": { "function": 1002 } } }))
        .unwrap();

    let mut sink = LocalFrameBuffer::new(8);
    let frame = engine.render_frame(&mut sink).unwrap();
    assert!(frame.failed.is_empty());
    assert!(sink.output().iter().all(|c| *c == [0, 0, 0]));
}

#[test]
fn brightness_is_capped_by_the_configured_limit() {
    let engine = engine(EngineConfig {
        brightness_limit: 0.5,
        ..EngineConfig::with_led_count(4)
    });
    engine.update_settings(&json!({ "brightness": 0.9 })).unwrap();
    assert_eq!(engine.get_settings().unwrap().global_brightness, 0.5);
}

#[test]
fn failed_recompile_keeps_the_previous_pattern() {
    let registry = PatternRegistry::new(Arc::new(ScriptCompiler::new()));
    let table = Arc::new(PaletteTable::build(&default_palettes()[&0]));
    let zero = PixelState::zero();
    let evaluate = |registry: &PatternRegistry, x: f64| {
        registry
            .callable(7)
            .unwrap()
            .unwrap()
            .evaluate(&PatternArgs {
                t: 0.3,
                dt: 0.0,
                x,
                y: 0.0,
                z: 0.0,
                prev: &zero,
                palette: &table,
            })
            .unwrap()
    };

    let report = registry.register(7, "let = ;").unwrap();
    assert!(!report.errors.is_empty());
    for x in [0.0, 0.25, 0.9] {
        let out = evaluate(&registry, x);
        assert_eq!(out.color, [0.0; 3]);
        assert_eq!(out.mode, ColorMode::Hsv);
    }

    registry.register(7, "rgb(x, t, 0.5)").unwrap();
    let before = evaluate(&registry, 0.25);
    let report = registry.register(7, "rgb(x, t,").unwrap();
    assert!(!report.installed);
    let after = evaluate(&registry, 0.25);
    assert_eq!(before.color, after.color);
    assert_eq!(after.mode, ColorMode::Rgb);
}

#[test]
fn repeating_an_update_changes_nothing() {
    let engine = engine(EngineConfig::with_led_count(10));
    let update = json!({
        "global_brightness": 0.4,
        "groups": {
            "main": { "speed": 0.5, "range_end": 5 },
            "second": { "range_start": 5, "range_end": 10, "function": 310 },
        },
    });
    engine.update_settings(&update).unwrap();
    let once = engine.get_settings().unwrap();
    let changes = engine.update_settings(&update).unwrap();
    assert!(!changes.changed);
    assert_eq!(*once, *engine.get_settings().unwrap());
}

#[test]
fn groups_render_independently() {
    let engine = engine(EngineConfig::with_led_count(10));
    use_pattern(&engine, 1003, "rgb(1.0, 0.0, 0.0)");
    engine
        .update_function(1004, PatternDefinition::new("blue", "rgb(0.0, 0.0, 1.0)"))
        .unwrap();
    engine
        .update_settings(&json!({
            "groups": {
                "main": { "range_end": 5 },
                "second": { "range_start": 5, "range_end": 10, "function": 1004 },
            }
        }))
        .unwrap();

    let mut sink = LocalFrameBuffer::new(10);
    let frame = engine.render_frame(&mut sink).unwrap();
    assert_eq!(frame.groups, 2);
    assert_eq!(sink.input()[4], [1.0, 0.0, 0.0]);
    assert_eq!(sink.input()[5], [0.0, 0.0, 1.0]);

    engine.remove_group("second").unwrap();
    assert!(engine.remove_group("main").is_err());
    engine.render_frame(&mut sink).unwrap();
    assert_eq!(sink.output()[7], [0, 0, 0]);
}

#[test]
fn pattern_changes_restart_the_clock() {
    let engine = engine(EngineConfig::with_led_count(4));
    thread::sleep(Duration::from_millis(50));
    let before = engine.elapsed();
    engine
        .update_settings(&json!({ "groups": { "main": { "function": 310 } } }))
        .unwrap();
    assert!(engine.elapsed() < before);
}

#[test]
fn preserved_clock_ignores_pattern_changes() {
    let engine = engine(EngineConfig {
        no_timer_reset: true,
        ..EngineConfig::with_led_count(4)
    });
    thread::sleep(Duration::from_millis(50));
    engine
        .update_settings(&json!({ "groups": { "main": { "function": 310 } } }))
        .unwrap();
    assert!(engine.elapsed() >= 0.05);
}

#[test]
fn timer_resets_never_go_negative() {
    let engine = engine(EngineConfig::with_led_count(4));
    engine.start(Box::new(LocalFrameBuffer::new(4))).unwrap();
    for _ in 0..20 {
        engine.reset_timer();
        assert!(engine.elapsed() >= 0.0);
        assert!(engine.get_frame_rate().unwrap() >= 0.0);
    }
    engine.stop().unwrap();
}

#[test]
fn external_frames_reach_external_groups() {
    let engine = engine(EngineConfig::with_led_count(3));
    engine
        .update_settings(&json!({ "groups": { "main": { "external_source": true } } }))
        .unwrap();
    engine.push_dmx_frame(&[255, 0, 0, 0, 255, 0, 0, 0, 255]).unwrap();

    let mut sink = LocalFrameBuffer::new(3);
    engine.render_frame(&mut sink).unwrap();
    assert_eq!(sink.input()[2], [0.0, 0.0, 1.0]);
    assert_eq!(sink.modes()[2], ColorMode::Rgb);
}

#[test]
fn running_loop_drives_the_sink() {
    let engine = engine(EngineConfig {
        refresh_rate: 100.0,
        ..EngineConfig::with_led_count(4)
    });
    engine
        .update_settings(&json!({ "groups": { "main": { "function": 100 } } }))
        .unwrap();
    let started = Instant::now();
    engine.start(Box::new(LocalFrameBuffer::new(4))).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(engine.get_frame_rate().unwrap() > 0.0);
    engine.stop().unwrap();
    assert!(!engine.is_running());
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Every source compiles to a pattern that takes 150 ms per LED.
struct SlowCompiler;

struct SlowPattern;

impl Pattern for SlowPattern {
    fn evaluate(&self, _args: &PatternArgs<'_>) -> Result<PatternOutput, EvaluationError> {
        thread::sleep(Duration::from_millis(150));
        Ok(PatternOutput::black())
    }
}

impl PatternCompiler for SlowCompiler {
    fn compile(&self, _source: &str) -> Result<Compiled, Diagnostics> {
        Ok(Compiled {
            pattern: Arc::new(SlowPattern),
            warnings: Vec::new(),
        })
    }
}

#[test]
fn control_calls_do_not_wait_for_a_slow_frame() {
    let engine =
        AnimationEngine::with_compiler(EngineConfig::with_led_count(2), Arc::new(SlowCompiler))
            .unwrap();
    engine.start(Box::new(LocalFrameBuffer::new(2))).unwrap();
    thread::sleep(Duration::from_millis(50));

    let mut worst = Duration::ZERO;
    for function in [310, 100, 310, 100, 310] {
        let started = Instant::now();
        engine
            .update_settings(&json!({ "groups": { "main": { "function": function } } }))
            .unwrap();
        engine
            .update_function(2000, PatternDefinition::new("slow", "anything"))
            .unwrap();
        worst = worst.max(started.elapsed());
    }
    engine.stop().unwrap();
    assert!(worst < Duration::from_millis(100), "worst control call took {worst:?}");
}
