//! Color palettes and their precomputed lookup tables.
//!
//! A palette is an ordered list of HSV control points spanning [0, 1). Each
//! palette owns a fixed-size table of interpolated colors so that the per
//! pixel lookup in a pattern is a single index computation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::{color::fract, LedControlError, Result};

/// Number of interpolated entries in every [`PaletteTable`].
pub const PALETTE_TABLE_SIZE: usize = 1000;

const MIRROR_SPAN: usize = 2 * PALETTE_TABLE_SIZE - 1;

/// Id of the palette every group falls back to.
pub const DEFAULT_PALETTE_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaletteMode {
    #[default]
    Hsv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    pub name: String,
    #[serde(default)]
    pub mode: PaletteMode,
    /// HSV control points, at least two.
    pub colors: Vec<[f64; 3]>,
    #[serde(rename = "default", default)]
    pub is_default: bool,
}

impl Palette {
    pub fn new(name: impl Into<String>, colors: Vec<[f64; 3]>) -> Self {
        Self {
            name: name.into(),
            mode: PaletteMode::Hsv,
            colors,
            is_default: false,
        }
    }

    fn builtin(name: &str, colors: Vec<[f64; 3]>) -> Self {
        Self {
            is_default: true,
            ..Self::new(name, colors)
        }
    }

    fn validate(&self, id: u32) -> Result<()> {
        if self.colors.len() < 2 {
            return Err(LedControlError::InvalidPalette {
                id,
                reason: format!("needs at least 2 colors, got {}", self.colors.len()),
            });
        }
        if self.colors.iter().flatten().any(|c| !c.is_finite()) {
            return Err(LedControlError::InvalidPalette {
                id,
                reason: "colors must be finite".to_string(),
            });
        }
        Ok(())
    }
}

/// Built-in palettes, keyed by id.
pub fn default_palettes() -> BTreeMap<u32, Palette> {
    BTreeMap::from([
        (
            DEFAULT_PALETTE_ID,
            Palette::builtin("Spectrum", vec![[0.0, 1.0, 1.0], [1.0, 1.0, 1.0]]),
        ),
        (
            1,
            Palette::builtin(
                "Sunset",
                vec![
                    [0.8, 0.9, 0.5],
                    [0.97, 0.85, 0.9],
                    [0.06, 0.9, 1.0],
                    [0.12, 0.7, 1.0],
                    [0.8, 0.9, 0.5],
                ],
            ),
        ),
        (
            2,
            Palette::builtin(
                "Ocean",
                vec![
                    [0.5, 1.0, 0.6],
                    [0.58, 0.9, 1.0],
                    [0.66, 1.0, 0.7],
                    [0.5, 1.0, 0.6],
                ],
            ),
        ),
        (
            3,
            Palette::builtin(
                "Fire",
                vec![
                    [0.0, 1.0, 0.3],
                    [0.02, 1.0, 1.0],
                    [0.1, 0.9, 1.0],
                    [0.14, 0.4, 1.0],
                    [0.0, 1.0, 0.3],
                ],
            ),
        ),
        (
            4,
            Palette::builtin(
                "Forest",
                vec![[0.22, 0.9, 0.6], [0.33, 0.8, 1.0], [0.4, 0.9, 0.5], [0.22, 0.9, 0.6]],
            ),
        ),
    ])
}

/// Fixed-resolution interpolation of one palette.
#[derive(Debug, Clone, PartialEq)]
pub struct PaletteTable {
    entries: Vec<[f64; 3]>,
    control_points: usize,
}

impl PaletteTable {
    /// Interpolates `palette` into [`PALETTE_TABLE_SIZE`] entries.
    ///
    /// Saturation and value are interpolated linearly. Hue takes the shortest
    /// way around the color wheel unless two neighbouring points are exactly
    /// one full turn apart, which requests a complete sweep.
    pub fn build(palette: &Palette) -> Self {
        let colors = &palette.colors;
        if colors.len() < 2 {
            let color = colors.first().copied().unwrap_or([0.0; 3]);
            return Self {
                entries: vec![color; PALETTE_TABLE_SIZE],
                control_points: colors.len(),
            };
        }

        let sectors = colors.len() - 1;
        let sector_size = 1.0 / sectors as f64;
        let entries = (0..PALETTE_TABLE_SIZE)
            .map(|i| {
                let f = i as f64 / PALETTE_TABLE_SIZE as f64;
                let sector = ((f / sector_size).floor() as usize).min(sectors - 1);
                let local = (f - sector as f64 * sector_size) / sector_size;
                let (c1, c2) = (colors[sector], colors[sector + 1]);

                let mut dh = c2[0] - c1[0];
                if dh.abs() != 1.0 {
                    if dh < -0.5 {
                        dh += 1.0;
                    }
                    if dh > 0.5 {
                        dh -= 1.0;
                    }
                }

                [
                    fract(c1[0] + local * dh),
                    c1[1] + local * (c2[1] - c1[1]),
                    c1[2] + local * (c2[2] - c1[2]),
                ]
            })
            .collect();

        Self {
            entries,
            control_points: colors.len(),
        }
    }

    pub fn entries(&self) -> &[[f64; 3]] {
        &self.entries
    }

    /// Number of control points of the source palette.
    pub fn control_points(&self) -> usize {
        self.control_points
    }

    /// Table index for `t`; the palette repeats with period 1.
    pub fn index(t: f64) -> usize {
        if !t.is_finite() {
            return 0;
        }
        ((fract(t) * PALETTE_TABLE_SIZE as f64) as usize).min(PALETTE_TABLE_SIZE - 1)
    }

    /// Table index that walks the palette forwards then backwards, so that
    /// `mirrored_index(t) == mirrored_index(-t)`.
    pub fn mirrored_index(t: f64) -> usize {
        if !t.is_finite() {
            return PALETTE_TABLE_SIZE - 1;
        }
        let k = ((fract(t.abs()) * (MIRROR_SPAN as f64 - 0.1)) as usize) % MIRROR_SPAN;
        k.abs_diff(PALETTE_TABLE_SIZE - 1)
    }

    pub fn get_color(&self, t: f64) -> [f64; 3] {
        self.entries[Self::index(t)]
    }

    pub fn get_color_mirrored(&self, t: f64) -> [f64; 3] {
        self.entries[Self::mirrored_index(t)]
    }
}

#[derive(Debug)]
struct PaletteStoreInner {
    palettes: BTreeMap<u32, Palette>,
    tables: HashMap<u32, Arc<PaletteTable>>,
}

/// Thread-safe set of palettes and their tables.
///
/// Tables are rebuilt outside the lock and installed with a single `Arc`
/// swap, so readers only ever see a complete table.
#[derive(Debug)]
pub struct PaletteStore {
    inner: RwLock<PaletteStoreInner>,
}

impl Default for PaletteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PaletteStore {
    /// Creates a store holding the built-in palettes.
    pub fn new() -> Self {
        let palettes = default_palettes();
        let tables = palettes
            .iter()
            .map(|(id, palette)| (*id, Arc::new(PaletteTable::build(palette))))
            .collect();
        Self {
            inner: RwLock::new(PaletteStoreInner { palettes, tables }),
        }
    }

    /// Inserts or replaces a palette and rebuilds only its table.
    ///
    /// Editing a built-in palette keeps it built in.
    pub fn set_palette(&self, id: u32, mut palette: Palette) -> Result<()> {
        palette.validate(id)?;
        let table = Arc::new(PaletteTable::build(&palette));
        let mut inner = self.write()?;
        palette.is_default = inner.palettes.get(&id).is_some_and(|p| p.is_default);
        inner.palettes.insert(id, palette);
        inner.tables.insert(id, table);
        tracing::debug!(id, "palette table rebuilt");
        Ok(())
    }

    pub fn remove_palette(&self, id: u32) -> Result<()> {
        let mut inner = self.write()?;
        match inner.palettes.get(&id) {
            None => Err(LedControlError::UnknownPalette(id)),
            Some(palette) if palette.is_default => Err(LedControlError::DefaultNotRemovable {
                kind: "palette",
                id,
            }),
            Some(_) => {
                inner.palettes.remove(&id);
                inner.tables.remove(&id);
                Ok(())
            }
        }
    }

    pub fn palettes(&self) -> Result<BTreeMap<u32, Palette>> {
        Ok(self.read()?.palettes.clone())
    }

    pub fn contains(&self, id: u32) -> Result<bool> {
        Ok(self.read()?.palettes.contains_key(&id))
    }

    /// Table for `id`, or the default palette's table for unknown ids.
    pub fn table(&self, id: u32) -> Result<Arc<PaletteTable>> {
        let inner = self.read()?;
        inner
            .tables
            .get(&id)
            .or_else(|| inner.tables.get(&DEFAULT_PALETTE_ID))
            .cloned()
            .ok_or(LedControlError::UnknownPalette(id))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, PaletteStoreInner>> {
        self.inner
            .read()
            .map_err(|_| LedControlError::Poisoned("palette store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, PaletteStoreInner>> {
        self.inner
            .write()
            .map_err(|_| LedControlError::Poisoned("palette store"))
    }
}
