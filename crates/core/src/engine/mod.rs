//! The animation engine: owns every store, the render loop and the
//! compositor, and exposes the operations a control surface needs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::EngineConfig;
use crate::external::ExternalFrameBuffer;
use crate::mapping::SpatialMapper;
use crate::output::{OutputRoute, OutputSink};
use crate::palette::{default_palettes, Palette, PaletteStore};
use crate::pattern::script::ScriptCompiler;
use crate::pattern::{CompileReport, PatternCompiler, PatternDefinition, PatternRegistry};
use crate::persist::{SavedFunction, SavedState, SAVE_VERSION};
use crate::render::{FrameCompositor, FrameContext, FrameReport};
use crate::settings::{ChangeSet, Settings, SettingsStore};
use crate::timeline::{RenderClock, RenderScheduler};
use crate::{LedControlError, Result};

/// Compositor work requested by control calls, applied by the next cycle.
#[derive(Debug, Default)]
struct PendingWork {
    invalidate: bool,
    reset_all: bool,
    reset_groups: BTreeSet<String>,
    clear: bool,
}

struct Shared {
    config: EngineConfig,
    settings: SettingsStore,
    patterns: PatternRegistry,
    palettes: PaletteStore,
    presets: RwLock<BTreeMap<String, Value>>,
    external: ExternalFrameBuffer,
    clock: RenderClock,
    /// Bumped by every settings, pattern and palette change.
    changes: AtomicU64,
    /// Only ever locked by render cycles.
    compositor: Mutex<FrameCompositor>,
    pending: Mutex<PendingWork>,
}

impl Shared {
    fn cycle(&self, now: Instant, sink: &mut dyn OutputSink) -> Result<FrameReport> {
        let pending = std::mem::take(&mut *self.pending()?);
        let settings = self.settings.snapshot()?;
        let generation = self
            .changes
            .load(Ordering::Acquire)
            .wrapping_add(self.external.generation());
        let ctx = FrameContext {
            settings: &settings,
            patterns: &self.patterns,
            palettes: &self.palettes,
            external: &self.external,
            time: self.clock.elapsed_at(now),
            generation,
        };

        let mut compositor = self.compositor()?;
        if pending.invalidate {
            compositor.invalidate();
        }
        if pending.reset_all {
            compositor.reset_states();
        }
        for group in pending
            .reset_groups
            .iter()
            .filter_map(|key| settings.groups.get(key))
        {
            compositor.reset_group_states(group);
        }
        if pending.clear {
            compositor.request_clear();
        }
        compositor.render(&ctx, sink)
    }

    fn touch(&self) {
        self.changes.fetch_add(1, Ordering::AcqRel);
    }

    fn compositor(&self) -> Result<MutexGuard<'_, FrameCompositor>> {
        self.compositor
            .lock()
            .map_err(|_| LedControlError::Poisoned("frame compositor"))
    }

    fn pending(&self) -> Result<MutexGuard<'_, PendingWork>> {
        self.pending
            .lock()
            .map_err(|_| LedControlError::Poisoned("pending render work"))
    }

    /// Restarts the clock and zeroes pixel state unless the engine was told
    /// to keep animations running across changes.
    fn reset_animation_state(&self) -> Result<()> {
        if self.config.no_timer_reset {
            return Ok(());
        }
        self.clock.reset();
        self.pending()?.reset_all = true;
        Ok(())
    }

    fn apply_changes(&self, changes: &ChangeSet) -> Result<()> {
        if !changes.changed {
            return Ok(());
        }
        let mut pending = self.pending()?;
        if !changes.repatterned.is_empty() && !self.config.no_timer_reset {
            self.clock.reset();
            pending
                .reset_groups
                .extend(changes.repatterned.iter().cloned());
        }
        if changes.clear_leds {
            pending.clear = true;
        }
        drop(pending);
        self.touch();
        Ok(())
    }

    fn presets(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>>> {
        self.presets
            .read()
            .map_err(|_| LedControlError::Poisoned("presets"))
    }

    fn presets_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Value>>> {
        self.presets
            .write()
            .map_err(|_| LedControlError::Poisoned("presets"))
    }
}

/// Renders the configured groups to an [`OutputSink`] at a fixed rate.
///
/// Every method takes `&self`; the engine can be shared behind an `Arc`
/// between the render loop owner and any number of control threads.
pub struct AnimationEngine {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<RenderScheduler>>,
}

impl AnimationEngine {
    /// Builds an engine with the built-in patterns compiled by the Rhai
    /// sandbox.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_compiler(config, Arc::new(ScriptCompiler::new()))
    }

    pub fn with_compiler(config: EngineConfig, compiler: Arc<dyn PatternCompiler>) -> Result<Self> {
        config.validate()?;
        let mapper = SpatialMapper::new(config.led_count, &config.mapping)?;
        let compositor = FrameCompositor::new(mapper, config.color_correction);
        let settings = SettingsStore::new(Settings::default(), config.brightness_limit);
        tracing::info!(
            led_count = config.led_count,
            refresh_rate = config.refresh_rate,
            "animation engine created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                patterns: PatternRegistry::with_builtins(compiler),
                palettes: PaletteStore::new(),
                presets: RwLock::new(BTreeMap::new()),
                external: ExternalFrameBuffer::new(),
                clock: RenderClock::new(),
                changes: AtomicU64::new(0),
                compositor: Mutex::new(compositor),
                pending: Mutex::new(PendingWork::default()),
                config,
            }),
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn led_count(&self) -> usize {
        self.shared.config.led_count
    }

    pub fn get_settings(&self) -> Result<Arc<Settings>> {
        self.shared.settings.snapshot()
    }

    /// Merges a partial settings document; see [`SettingsStore::update`].
    pub fn update_settings(&self, partial: &Value) -> Result<ChangeSet> {
        let changes = self.shared.settings.update(partial)?;
        self.shared.apply_changes(&changes)?;
        Ok(changes)
    }

    pub fn remove_group(&self, key: &str) -> Result<()> {
        self.shared.settings.remove_group(key)?;
        self.shared.pending()?.clear = true;
        self.shared.touch();
        Ok(())
    }

    pub fn get_functions(&self) -> Result<BTreeMap<u32, PatternDefinition>> {
        self.shared.patterns.get_functions()
    }

    /// Recompiles the stored source of pattern `id`.
    pub fn compile_function(&self, id: u32) -> Result<CompileReport> {
        let report = self.shared.patterns.compile_function(id)?;
        self.after_compile(&report)?;
        Ok(report)
    }

    /// Stores and compiles a pattern definition.
    pub fn update_function(&self, id: u32, definition: PatternDefinition) -> Result<CompileReport> {
        let report = self.shared.patterns.update_function(id, definition)?;
        self.after_compile(&report)?;
        Ok(report)
    }

    pub fn remove_function(&self, id: u32) -> Result<()> {
        self.shared.patterns.remove_function(id)?;
        self.shared.touch();
        Ok(())
    }

    fn after_compile(&self, report: &CompileReport) -> Result<()> {
        self.shared.touch();
        if report.installed {
            self.shared.reset_animation_state()?;
        }
        Ok(())
    }

    pub fn get_palettes(&self) -> Result<BTreeMap<u32, Palette>> {
        self.shared.palettes.palettes()
    }

    pub fn update_palette(&self, id: u32, palette: Palette) -> Result<()> {
        self.shared.palettes.set_palette(id, palette)?;
        self.shared.touch();
        Ok(())
    }

    pub fn remove_palette(&self, id: u32) -> Result<()> {
        self.shared.palettes.remove_palette(id)?;
        self.shared.touch();
        Ok(())
    }

    pub fn get_presets(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.shared.presets()?.clone())
    }

    pub fn update_preset(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.shared.presets_mut()?.insert(key.into(), value);
        Ok(())
    }

    pub fn remove_preset(&self, key: &str) -> Result<()> {
        self.shared
            .presets_mut()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| LedControlError::UnknownPreset(key.to_string()))
    }

    /// Frames per second since the previous call; zero while stopped.
    pub fn get_frame_rate(&self) -> Result<f64> {
        match self.scheduler()?.as_ref() {
            Some(scheduler) => scheduler.stats().rate(),
            None => Ok(0.0),
        }
    }

    /// Mean render cycle duration since the previous call.
    pub fn get_average_cost(&self) -> Result<Duration> {
        match self.scheduler()?.as_ref() {
            Some(scheduler) => scheduler.stats().average_cost(),
            None => Ok(Duration::ZERO),
        }
    }

    /// Seconds on the animation clock.
    pub fn elapsed(&self) -> f64 {
        self.shared.clock.elapsed()
    }

    pub fn reset_timer(&self) {
        self.shared.clock.reset();
    }

    /// Starts the render loop, which takes ownership of `sink`.
    pub fn start(&self, mut sink: Box<dyn OutputSink>) -> Result<()> {
        let mut scheduler = self.scheduler()?;
        if scheduler.as_ref().is_some_and(RenderScheduler::is_running) {
            return Err(LedControlError::msg("render loop is already running"));
        }
        if !self.shared.config.no_timer_reset {
            self.shared.clock.reset();
        }
        self.shared.pending()?.invalidate = true;

        let shared = Arc::clone(&self.shared);
        *scheduler = Some(RenderScheduler::start(
            self.shared.config.refresh_rate,
            move |start| {
                if let Err(err) = shared.cycle(start, sink.as_mut()) {
                    tracing::warn!(error = %err, "render cycle failed");
                }
            },
        )?);
        Ok(())
    }

    /// Stops the render loop and waits for its last frame.
    pub fn stop(&self) -> Result<()> {
        let scheduler = self.scheduler()?.take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.scheduler()
            .map(|scheduler| scheduler.as_ref().is_some_and(RenderScheduler::is_running))
            .unwrap_or(false)
    }

    /// Renders one frame synchronously into `sink`.
    pub fn render_frame(&self, sink: &mut dyn OutputSink) -> Result<FrameReport> {
        self.render_frame_at(Instant::now(), sink)
    }

    /// Renders one frame as if the loop had woken at `now`.
    pub fn render_frame_at(&self, now: Instant, sink: &mut dyn OutputSink) -> Result<FrameReport> {
        self.shared.cycle(now, sink)
    }

    /// Replaces the external frame shown by external-source groups.
    pub fn push_external_frame(&self, pixels: &[[f64; 3]]) -> Result<()> {
        self.shared.external.push_rgb(pixels)
    }

    /// Same as [`Self::push_external_frame`] for raw DMX channel data.
    pub fn push_dmx_frame(&self, data: &[u8]) -> Result<()> {
        self.shared.external.push_dmx(data)
    }

    /// Writes black to every route currently in use.
    pub fn clear_leds(&self, sink: &mut dyn OutputSink) -> Result<()> {
        let settings = self.get_settings()?;
        let mut routes = vec![OutputRoute::local()];
        for group in settings.groups.values() {
            let route = OutputRoute::of(group);
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        sink.clear(self.led_count(), &routes)?;
        Ok(())
    }

    /// Everything worth keeping across restarts.
    ///
    /// Built-in palettes are included only when they were edited.
    pub fn snapshot_state(&self) -> Result<SavedState> {
        let settings = Settings::clone(&*self.get_settings()?);
        let functions = self
            .get_functions()?
            .iter()
            .map(|(id, definition)| (*id, SavedFunction::from_definition(definition)))
            .collect();
        let builtins = default_palettes();
        let palettes = self
            .get_palettes()?
            .into_iter()
            .filter(|(id, palette)| !palette.is_default || builtins.get(id) != Some(palette))
            .collect();
        Ok(SavedState {
            save_version: SAVE_VERSION,
            settings,
            presets: self.get_presets()?,
            functions,
            palettes,
        })
    }

    /// Applies a saved state. Returns the compile reports of user patterns;
    /// a pattern that fails to compile is kept (as the blank pattern) so its
    /// source can still be edited.
    pub fn restore_state(&self, state: SavedState) -> Result<BTreeMap<u32, CompileReport>> {
        let changes = self.shared.settings.replace(state.settings)?;
        self.shared.apply_changes(&changes)?;
        *self.shared.presets_mut()? = state.presets;

        let mut reports = BTreeMap::new();
        for (id, function) in state.functions {
            if function.is_default {
                if let Err(err) = self.shared.patterns.update_metadata(
                    id,
                    None,
                    function.default_speed,
                    function.default_scale,
                ) {
                    tracing::warn!(id, error = %err, "saved metadata for unknown built-in ignored");
                }
                continue;
            }
            let report = self
                .shared
                .patterns
                .update_function(id, function.into_definition(id))?;
            if !report.errors.is_empty() {
                tracing::warn!(id, errors = ?report.errors, "saved pattern failed to compile");
            }
            reports.insert(id, report);
        }

        for (id, palette) in state.palettes {
            if let Err(err) = self.shared.palettes.set_palette(id, palette) {
                tracing::warn!(id, error = %err, "saved palette ignored");
            }
        }
        self.shared.touch();
        Ok(reports)
    }

    fn scheduler(&self) -> Result<MutexGuard<'_, Option<RenderScheduler>>> {
        self.scheduler
            .lock()
            .map_err(|_| LedControlError::Poisoned("render scheduler"))
    }
}

impl Drop for AnimationEngine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "failed to stop render loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::LocalFrameBuffer;
    use serde_json::json;

    fn engine(led_count: usize) -> AnimationEngine {
        AnimationEngine::new(EngineConfig::with_led_count(led_count)).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(AnimationEngine::new(EngineConfig::with_led_count(0)).is_err());
    }

    #[test]
    fn built_in_patterns_are_available() {
        let engine = engine(4);
        let functions = engine.get_functions().unwrap();
        assert!(functions.contains_key(&0));
        assert!(functions[&310].is_default);
    }

    #[test]
    fn presets_can_be_added_and_removed() {
        let engine = engine(4);
        engine.update_preset("evening", json!({ "global_brightness": 0.3 })).unwrap();
        assert_eq!(engine.get_presets().unwrap().len(), 1);
        engine.remove_preset("evening").unwrap();
        assert!(matches!(
            engine.remove_preset("evening"),
            Err(LedControlError::UnknownPreset(_))
        ));
    }

    #[test]
    fn settings_changes_trigger_a_new_frame() {
        let engine = engine(4);
        engine
            .update_settings(&json!({ "groups": { "main": { "speed": 0.0 } } }))
            .unwrap();
        let mut sink = LocalFrameBuffer::new(4);
        assert!(engine.render_frame(&mut sink).unwrap().rendered);
        assert!(!engine.render_frame(&mut sink).unwrap().rendered);
        engine
            .update_settings(&json!({ "global_brightness": 0.5 }))
            .unwrap();
        assert!(engine.render_frame(&mut sink).unwrap().rendered);
    }

    #[test]
    fn start_and_stop_the_loop() {
        let engine = engine(8);
        engine.start(Box::new(LocalFrameBuffer::new(8))).unwrap();
        assert!(engine.is_running());
        assert!(engine.start(Box::new(LocalFrameBuffer::new(8))).is_err());
        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.get_frame_rate().unwrap(), 0.0);
    }

    #[test]
    fn edited_builtin_palettes_are_saved() {
        let engine = engine(4);
        assert!(engine.snapshot_state().unwrap().palettes.is_empty());
        engine
            .update_palette(1, Palette::new("Sunset", vec![[0.0, 1.0, 1.0], [0.1, 1.0, 1.0]]))
            .unwrap();
        let saved = engine.snapshot_state().unwrap();
        assert!(saved.palettes[&1].is_default);
        assert!(engine.remove_palette(1).is_err());
    }
}
