//! Core library of the LED animation engine.
//!
//! An [`AnimationEngine`] evaluates color patterns over the spatial mapping of
//! an LED strip or matrix at a fixed frame rate. The strip is split into
//! groups with independent pattern, palette, speed and output settings; every
//! frame is composited group by group into an [`OutputSink`].

pub mod color;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod mapping;
pub mod output;
pub mod palette;
pub mod pattern;
pub mod persist;
pub mod render;
pub mod settings;
pub mod timeline;

pub use color::ColorMode;
pub use config::EngineConfig;
pub use engine::AnimationEngine;
pub use error::{LedControlError, Result};
pub use external::ExternalFrameBuffer;
pub use mapping::{LedPosition, Mapping, SpatialMapper};
pub use output::{LocalFrameBuffer, OutputRoute, OutputSink, RangeFrame, RoutedSink, TransportError};
pub use palette::{Palette, PaletteStore, PaletteTable};
pub use pattern::script::ScriptCompiler;
pub use pattern::{
    CompileReport, Pattern, PatternArgs, PatternCompiler, PatternDefinition, PatternOutput,
    PatternRegistry, PixelState,
};
pub use persist::{SaveFile, SavedState};
pub use render::{FrameCompositor, FrameReport};
pub use settings::{ChangeSet, GroupSettings, RenderMode, Settings, SettingsStore};
pub use timeline::{RenderClock, RenderScheduler};
