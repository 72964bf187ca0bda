use serde::{Deserialize, Serialize};

use crate::{mapping::Mapping, LedControlError, Result};

/// Construction parameters for [`crate::AnimationEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub led_count: usize,
    /// Target frames per second of the render loop.
    pub refresh_rate: f64,
    /// Ceiling applied to every brightness update, in [0, 1].
    pub brightness_limit: f64,
    /// Keep the animation clock and per-pixel state running across pattern
    /// changes so long-running installations never visibly jump.
    pub no_timer_reset: bool,
    /// Fixed per-channel correction of the physical strip, multiplied into
    /// the color temperature correction.
    pub color_correction: [f64; 3],
    pub mapping: Mapping,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            led_count: 100,
            refresh_rate: 60.0,
            brightness_limit: 1.0,
            no_timer_reset: false,
            color_correction: [1.0, 1.0, 1.0],
            mapping: Mapping::Line,
        }
    }
}

impl EngineConfig {
    pub fn with_led_count(led_count: usize) -> Self {
        Self {
            led_count,
            ..Self::default()
        }
    }

    /// Rejects values the engine cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.led_count == 0 {
            return Err(LedControlError::InvalidConfig(
                "led_count must be at least 1".to_string(),
            ));
        }
        if !(self.refresh_rate.is_finite() && self.refresh_rate > 0.0) {
            return Err(LedControlError::InvalidConfig(format!(
                "refresh_rate must be positive, got {}",
                self.refresh_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.brightness_limit) {
            return Err(LedControlError::InvalidConfig(format!(
                "brightness_limit must be within [0, 1], got {}",
                self.brightness_limit
            )));
        }
        if self.color_correction.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(LedControlError::InvalidConfig(
                "color_correction channels must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_empty_strips_and_bad_rates() {
        assert!(EngineConfig::with_led_count(0).validate().is_err());

        let config = EngineConfig {
            refresh_rate: 0.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            brightness_limit: 1.5,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("brightness_limit"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "led_count": 12 }"#).unwrap();
        assert_eq!(config.led_count, 12);
        assert_eq!(config.refresh_rate, 60.0);
        assert!(matches!(config.mapping, Mapping::Line));
    }
}
