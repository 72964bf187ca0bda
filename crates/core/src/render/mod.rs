//! Per-frame compositing of every LED group into the output sink.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::color::{wave_pulse, ColorMode};
use crate::external::ExternalFrameBuffer;
use crate::mapping::{LedPosition, SpatialMapper};
use crate::output::{OutputRoute, OutputSink, RangeFrame};
use crate::palette::{PaletteStore, PaletteTable};
use crate::pattern::{EvaluationError, Pattern, PatternArgs, PatternRegistry, PixelState};
use crate::settings::{GroupSettings, Settings};
use crate::Result;

/// Everything a frame reads, snapshotted by the caller.
pub struct FrameContext<'a> {
    pub settings: &'a Settings,
    pub patterns: &'a PatternRegistry,
    pub palettes: &'a PaletteStore,
    pub external: &'a ExternalFrameBuffer,
    /// Wrapped clock time in seconds.
    pub time: f64,
    /// Changes whenever settings, patterns, palettes or external frames do.
    pub generation: u64,
}

/// What happened during one [`FrameCompositor::render`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    /// False when nothing changed and nothing animates.
    pub rendered: bool,
    pub groups: usize,
    /// Groups that showed the error pulse this frame.
    pub failed: Vec<String>,
}

#[derive(Debug)]
struct ScaledMapping {
    range: Range<usize>,
    scale: f64,
    positions: Vec<LedPosition>,
}

/// Owns the per-LED state and the per-group scaled mappings.
#[derive(Debug)]
pub struct FrameCompositor {
    mapper: SpatialMapper,
    strip_correction: [f64; 3],
    mappings: HashMap<String, ScaledMapping>,
    states: Vec<PixelState>,
    last_time: Option<f64>,
    last_generation: Option<u64>,
    animating: bool,
    clear_requested: bool,
    last_routes: Vec<OutputRoute>,
}

impl FrameCompositor {
    pub fn new(mapper: SpatialMapper, strip_correction: [f64; 3]) -> Self {
        let led_count = mapper.led_count();
        Self {
            mapper,
            strip_correction,
            mappings: HashMap::new(),
            states: vec![PixelState::zero(); led_count],
            last_time: None,
            last_generation: None,
            animating: false,
            clear_requested: false,
            last_routes: Vec::new(),
        }
    }

    pub fn led_count(&self) -> usize {
        self.mapper.led_count()
    }

    pub fn states(&self) -> &[PixelState] {
        &self.states
    }

    /// Zeroes the carried state of every LED.
    pub fn reset_states(&mut self) {
        self.states.fill(PixelState::zero());
    }

    /// Zeroes the carried state of one group's LEDs.
    pub fn reset_group_states(&mut self, group: &GroupSettings) {
        let range = self.clamp_range(group);
        self.states[range].fill(PixelState::zero());
    }

    /// Blacks out every route on the next frame before drawing.
    pub fn request_clear(&mut self) {
        self.clear_requested = true;
    }

    /// Forces the next frame to render even if nothing changed.
    pub fn invalidate(&mut self) {
        self.last_generation = None;
    }

    /// Whether [`Self::render`] would do any work for `generation`.
    pub fn needs_frame(&self, generation: u64) -> bool {
        self.clear_requested || self.animating || self.last_generation != Some(generation)
    }

    pub fn render(&mut self, ctx: &FrameContext<'_>, sink: &mut dyn OutputSink) -> Result<FrameReport> {
        let frame_dt = self
            .last_time
            .map_or(0.0, |last| (ctx.time - last).max(0.0));
        self.last_time = Some(ctx.time);

        if !self.needs_frame(ctx.generation) {
            return Ok(FrameReport::default());
        }

        let settings = ctx.settings;
        let routes = self.routes(settings);
        if self.clear_requested {
            let mut stale = self.last_routes.clone();
            for route in &routes {
                if !stale.contains(route) {
                    stale.push(route.clone());
                }
            }
            if let Err(err) = sink.clear(self.led_count(), &stale) {
                tracing::warn!(error = %err, "failed to clear outputs");
            }
            self.clear_requested = false;
        }
        self.mappings.retain(|key, _| settings.groups.contains_key(key));

        let external = if settings.sacn || settings.groups.values().any(|g| g.external_source) {
            ctx.external.latest()?
        } else {
            None
        };

        let mut report = FrameReport {
            rendered: true,
            groups: 0,
            failed: Vec::new(),
        };
        let mut animating = false;

        for (key, group) in &settings.groups {
            let range = self.clamp_range(group);
            if range.is_empty() {
                continue;
            }
            report.groups += 1;
            let route = OutputRoute::of(group);
            let brightness = settings.effective_brightness(group);
            let correction = settings.correction(group, self.strip_correction);

            if settings.calibration {
                if let Err(err) = sink.calibrate(&route, correction, brightness) {
                    tracing::warn!(group = key.as_str(), error = %err, "calibration output failed");
                }
                continue;
            }

            let (pixels, mode, saturation, brightness) = if settings.sacn || group.external_source {
                animating = true;
                let pixels: Vec<[f64; 3]> = range
                    .clone()
                    .map(|i| {
                        external
                            .as_ref()
                            .and_then(|frame| frame.get(i).copied())
                            .unwrap_or([0.0; 3])
                    })
                    .collect();
                (pixels, ColorMode::Rgb, 1.0, brightness)
            } else {
                let t = ctx.time * group.speed;
                let dt = frame_dt * group.speed;
                match self.evaluate_group(ctx, key, group, range.clone(), t, dt) {
                    Ok((pixels, mode, is_static)) => {
                        if group.speed != 0.0 && brightness != 0.0 && !is_static {
                            animating = true;
                        }
                        (pixels, mode, settings.effective_saturation(group), brightness)
                    }
                    Err(err) => {
                        tracing::warn!(
                            group = key.as_str(),
                            pattern = group.function,
                            error = %err,
                            "pattern evaluation failed"
                        );
                        report.failed.push(key.clone());
                        animating = true;
                        let pulse = [0.1 * wave_pulse(ctx.time, 0.5), 0.0, 0.0];
                        (vec![pulse; range.len()], ColorMode::Rgb, 1.0, 1.0)
                    }
                }
            };

            let frame = RangeFrame {
                pixels: &pixels,
                start: range.start,
                end: range.end,
                correction,
                saturation,
                brightness,
                mode,
                route: &route,
            };
            if let Err(err) = sink.set_range(&frame) {
                tracing::warn!(group = key.as_str(), error = %err, "output failed");
            }
        }

        if let Err(err) = sink.render() {
            tracing::warn!(error = %err, "output render failed");
        }
        self.last_routes = routes;
        self.last_generation = Some(ctx.generation);
        self.animating = animating;
        Ok(report)
    }

    fn routes(&self, settings: &Settings) -> Vec<OutputRoute> {
        let mut routes: Vec<OutputRoute> = Vec::new();
        for group in settings.groups.values() {
            let route = OutputRoute::of(group);
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        routes
    }

    fn clamp_range(&self, group: &GroupSettings) -> Range<usize> {
        let end = group.range_end.min(self.led_count());
        group.range_start.min(end)..end
    }

    /// Runs the group's pattern over its range and reports whether the pattern
    /// is static. The state of the range is only replaced when every LED
    /// evaluated.
    fn evaluate_group(
        &mut self,
        ctx: &FrameContext<'_>,
        key: &str,
        group: &GroupSettings,
        range: Range<usize>,
        t: f64,
        dt: f64,
    ) -> std::result::Result<(Vec<[f64; 3]>, ColorMode, bool), EvaluationError> {
        let (pattern, is_static) = ctx
            .patterns
            .lookup(group.function)
            .map_err(|err| EvaluationError::Script(err.to_string()))?
            .ok_or(EvaluationError::Missing(group.function))?;
        let palette = ctx
            .palettes
            .table(group.palette)
            .map_err(|err| EvaluationError::Script(err.to_string()))?;

        self.refresh_mapping(key, &range, group.scale);
        let positions = self
            .mappings
            .get(key)
            .map(|mapping| mapping.positions.as_slice())
            .unwrap_or_default();

        let (pixels, mode, states) = evaluate_range(
            pattern.as_ref(),
            &palette,
            positions,
            &self.states[range.clone()],
            t,
            dt,
        )?;
        self.states[range].clone_from_slice(&states);
        Ok((pixels, mode, is_static))
    }

    fn refresh_mapping(&mut self, key: &str, range: &Range<usize>, scale: f64) {
        let current = self
            .mappings
            .get(key)
            .is_some_and(|m| m.range == *range && m.scale == scale);
        if current {
            return;
        }
        tracing::debug!(group = key, scale, "scaled mapping rebuilt");
        self.mappings.insert(
            key.to_string(),
            ScaledMapping {
                range: range.clone(),
                scale,
                positions: self.mapper.scaled_positions(range.clone(), scale),
            },
        );
    }
}

type RangeOutput = (Vec<[f64; 3]>, ColorMode, Vec<PixelState>);

/// Evaluates `pattern` once per position. The warm-up call at the origin
/// decides the color mode of the whole range.
fn evaluate_range(
    pattern: &dyn Pattern,
    palette: &Arc<PaletteTable>,
    positions: &[LedPosition],
    prev: &[PixelState],
    t: f64,
    dt: f64,
) -> std::result::Result<RangeOutput, EvaluationError> {
    let zero = PixelState::zero();
    let mode = pattern
        .evaluate(&PatternArgs {
            t: 0.0,
            dt: 0.1,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            prev: &zero,
            palette,
        })?
        .mode;

    let mut pixels = Vec::with_capacity(positions.len());
    let mut states = Vec::with_capacity(positions.len());
    for (position, prev) in positions.iter().zip(prev) {
        let output = pattern.evaluate(&PatternArgs {
            t,
            dt,
            x: position[0],
            y: position[1],
            z: position[2],
            prev,
            palette,
        })?;
        pixels.push(output.color);
        states.push(output.state);
    }
    Ok((pixels, mode, states))
}
