//! Pattern definitions and the registry of compiled pattern callables.
//!
//! The engine only depends on the [`Pattern`] and [`PatternCompiler`] traits;
//! [`script::ScriptCompiler`] is the Rhai-backed implementation used by
//! default.

pub mod builtin;
pub mod script;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rhai::Dynamic;
use serde::{Deserialize, Serialize};

use crate::{color::ColorMode, palette::PaletteTable, LedControlError, Result};

/// Opaque per-LED value threaded from one frame to the next.
///
/// Patterns decide its shape. The engine only creates the zero state and
/// stores whatever a pattern hands back.
#[derive(Debug, Clone)]
pub struct PixelState(Dynamic);

impl PixelState {
    /// `[0.0, 0.0, 0.0]`, the state every LED starts from.
    pub fn zero() -> Self {
        Self::from_color([0.0; 3])
    }

    pub fn from_color(color: [f64; 3]) -> Self {
        let array: rhai::Array = color.iter().map(|c| Dynamic::from_float(*c)).collect();
        Self(Dynamic::from_array(array))
    }

    pub fn from_dynamic(value: Dynamic) -> Self {
        Self(value)
    }

    pub fn as_dynamic(&self) -> &Dynamic {
        &self.0
    }
}

impl Default for PixelState {
    fn default() -> Self {
        Self::zero()
    }
}

/// Inputs of a single pattern evaluation.
pub struct PatternArgs<'a> {
    pub t: f64,
    pub dt: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub prev: &'a PixelState,
    /// Table of the palette selected by the group being rendered.
    pub palette: &'a Arc<PaletteTable>,
}

#[derive(Debug, Clone)]
pub struct PatternOutput {
    pub color: [f64; 3],
    pub mode: ColorMode,
    pub state: PixelState,
}

impl PatternOutput {
    pub fn black() -> Self {
        Self {
            color: [0.0; 3],
            mode: ColorMode::Hsv,
            state: PixelState::zero(),
        }
    }
}

/// Failure raised by a pattern while a frame is rendered.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error("script error: {0}")]
    Script(String),
    #[error("pattern returned {0}, expected a color")]
    InvalidOutput(String),
    #[error("unknown pattern {0}")]
    Missing(u32),
}

/// A compiled color function `(t, dt, x, y, z, prev_state) -> color`.
pub trait Pattern: Send + Sync {
    fn evaluate(&self, args: &PatternArgs<'_>) -> std::result::Result<PatternOutput, EvaluationError>;
}

/// Constant black, installed when a pattern id has never compiled.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlankPattern;

impl Pattern for BlankPattern {
    fn evaluate(&self, _args: &PatternArgs<'_>) -> std::result::Result<PatternOutput, EvaluationError> {
        Ok(PatternOutput::black())
    }
}

/// Successful compilation result.
pub struct Compiled {
    pub pattern: Arc<dyn Pattern>,
    pub warnings: Vec<String>,
}

/// Failed compilation result.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Turns pattern source text into a callable.
pub trait PatternCompiler: Send + Sync {
    fn compile(&self, source: &str) -> std::result::Result<Compiled, Diagnostics>;
}

/// Outcome of installing pattern source, as shown to the author.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Whether the new callable replaced the previous one.
    pub installed: bool,
}

fn default_pattern_speed() -> f64 {
    0.2
}

fn default_pattern_scale() -> f64 {
    1.0
}

/// User-visible description of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "default", default)]
    pub is_default: bool,
    #[serde(alias = "primary_speed", default = "default_pattern_speed")]
    pub default_speed: f64,
    #[serde(alias = "primary_scale", default = "default_pattern_scale")]
    pub default_scale: f64,
    /// Solid color patterns whose output never changes over time.
    #[serde(skip)]
    pub is_static: bool,
}

impl PatternDefinition {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            is_default: false,
            default_speed: default_pattern_speed(),
            default_scale: default_pattern_scale(),
            is_static: false,
        }
    }
}

struct PatternEntry {
    definition: PatternDefinition,
    callable: Arc<dyn Pattern>,
    /// False while `callable` is the blank stand-in.
    valid: bool,
}

/// Keyed store of pattern definitions and their compiled callables.
///
/// Compilation happens outside the lock; installing a callable is a single
/// `Arc` replacement, so a render cycle never observes a partial update.
pub struct PatternRegistry {
    compiler: Arc<dyn PatternCompiler>,
    entries: RwLock<BTreeMap<u32, PatternEntry>>,
}

impl fmt::Debug for PatternRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<u32> = self
            .entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("PatternRegistry").field("ids", &ids).finish()
    }
}

impl PatternRegistry {
    /// Creates an empty registry.
    pub fn new(compiler: Arc<dyn PatternCompiler>) -> Self {
        Self {
            compiler,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a registry holding every built-in pattern, compiled.
    pub fn with_builtins(compiler: Arc<dyn PatternCompiler>) -> Self {
        let registry = Self::new(compiler);
        for (id, definition) in builtin::default_patterns() {
            let report = registry.install_definition(id, definition);
            if !report.errors.is_empty() {
                tracing::error!(id, errors = ?report.errors, "built-in pattern failed to compile");
            }
        }
        registry
    }

    /// Compiles `source` and installs it under `id`.
    ///
    /// On errors the previous valid callable stays in place and an id that
    /// never compiled gets [`BlankPattern`]. A successful compile also stores
    /// `source`, so the definition always describes the installed callable.
    pub fn register(&self, id: u32, source: &str) -> Result<CompileReport> {
        let outcome = self.compiler.compile(source);
        let mut entries = self.write()?;
        let entry = entries.entry(id).or_insert_with(|| PatternEntry {
            definition: PatternDefinition::new(format!("Pattern {id}"), source),
            callable: Arc::new(BlankPattern),
            valid: false,
        });

        let report = match outcome {
            Ok(compiled) => {
                entry.callable = compiled.pattern;
                entry.valid = true;
                entry.definition.source = source.to_string();
                CompileReport {
                    errors: Vec::new(),
                    warnings: compiled.warnings,
                    installed: true,
                }
            }
            Err(diagnostics) => {
                if !entry.valid {
                    entry.callable = Arc::new(BlankPattern);
                }
                CompileReport {
                    errors: diagnostics.errors,
                    warnings: diagnostics.warnings,
                    installed: false,
                }
            }
        };
        tracing::debug!(
            id,
            installed = report.installed,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "pattern compiled"
        );
        Ok(report)
    }

    /// Recompiles the stored source of `id`.
    pub fn compile_function(&self, id: u32) -> Result<CompileReport> {
        let source = self
            .read()?
            .get(&id)
            .map(|entry| entry.definition.source.clone())
            .ok_or(LedControlError::UnknownPattern(id))?;
        self.register(id, &source)
    }

    /// Stores `definition` under `id` and compiles its source.
    ///
    /// Built-in ids keep their built-in and static flags.
    pub fn update_function(&self, id: u32, mut definition: PatternDefinition) -> Result<CompileReport> {
        {
            let mut entries = self.write()?;
            match entries.get_mut(&id) {
                Some(entry) => {
                    definition.is_default = entry.definition.is_default;
                    definition.is_static = entry.definition.is_static;
                    entry.definition = definition.clone();
                }
                None => {
                    definition.is_default = false;
                    definition.is_static = false;
                    entries.insert(
                        id,
                        PatternEntry {
                            definition: definition.clone(),
                            callable: Arc::new(BlankPattern),
                            valid: false,
                        },
                    );
                }
            }
        }
        self.register(id, &definition.source)
    }

    /// Applies saved metadata (name, default speed and scale) to a built-in.
    pub fn update_metadata(&self, id: u32, name: Option<String>, speed: f64, scale: f64) -> Result<()> {
        let mut entries = self.write()?;
        let entry = entries
            .get_mut(&id)
            .ok_or(LedControlError::UnknownPattern(id))?;
        if let Some(name) = name {
            entry.definition.name = name;
        }
        entry.definition.default_speed = speed;
        entry.definition.default_scale = scale;
        Ok(())
    }

    pub fn remove_function(&self, id: u32) -> Result<()> {
        let mut entries = self.write()?;
        match entries.get(&id) {
            None => Err(LedControlError::UnknownPattern(id)),
            Some(entry) if entry.definition.is_default => {
                Err(LedControlError::DefaultNotRemovable { kind: "pattern", id })
            }
            Some(_) => {
                entries.remove(&id);
                Ok(())
            }
        }
    }

    pub fn get_functions(&self) -> Result<BTreeMap<u32, PatternDefinition>> {
        Ok(self
            .read()?
            .iter()
            .map(|(id, entry)| (*id, entry.definition.clone()))
            .collect())
    }

    pub fn callable(&self, id: u32) -> Result<Option<Arc<dyn Pattern>>> {
        Ok(self.read()?.get(&id).map(|entry| entry.callable.clone()))
    }

    /// The callable of `id` together with its static flag, read under one
    /// lock.
    pub fn lookup(&self, id: u32) -> Result<Option<(Arc<dyn Pattern>, bool)>> {
        Ok(self
            .read()?
            .get(&id)
            .map(|entry| (entry.callable.clone(), entry.definition.is_static)))
    }

    pub fn is_static(&self, id: u32) -> Result<bool> {
        Ok(self
            .read()?
            .get(&id)
            .is_some_and(|entry| entry.definition.is_static))
    }

    fn install_definition(&self, id: u32, definition: PatternDefinition) -> CompileReport {
        let source = definition.source.clone();
        match self.write() {
            Ok(mut entries) => {
                entries.insert(
                    id,
                    PatternEntry {
                        definition,
                        callable: Arc::new(BlankPattern),
                        valid: false,
                    },
                );
            }
            Err(err) => {
                return CompileReport {
                    errors: vec![err.to_string()],
                    ..CompileReport::default()
                }
            }
        }
        self.register(id, &source).unwrap_or_else(|err| CompileReport {
            errors: vec![err.to_string()],
            ..CompileReport::default()
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<u32, PatternEntry>>> {
        self.entries
            .read()
            .map_err(|_| LedControlError::Poisoned("pattern registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<u32, PatternEntry>>> {
        self.entries
            .write()
            .map_err(|_| LedControlError::Poisoned("pattern registry"))
    }
}
