use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{LedControlError, Result};

/// Latest RGB frame received from an external source such as an sACN
/// listener. Only the newest frame is kept.
#[derive(Debug, Default)]
pub struct ExternalFrameBuffer {
    latest: Mutex<Option<Arc<Vec<[f64; 3]>>>>,
    generation: AtomicU64,
}

impl ExternalFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored frame with unit RGB triples.
    pub fn push_rgb(&self, pixels: &[[f64; 3]]) -> Result<()> {
        *self.lock()? = Some(Arc::new(pixels.to_vec()));
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Replaces the stored frame with DMX channel data: three bytes per
    /// pixel, a trailing partial pixel is dropped.
    pub fn push_dmx(&self, data: &[u8]) -> Result<()> {
        let pixels: Vec<[f64; 3]> = data
            .chunks_exact(3)
            .map(|rgb| [0, 1, 2].map(|i| f64::from(rgb[i]) / 255.0))
            .collect();
        self.push_rgb(&pixels)
    }

    pub fn latest(&self) -> Result<Option<Arc<Vec<[f64; 3]>>>> {
        Ok(self.lock()?.clone())
    }

    /// Bumped on every push.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Arc<Vec<[f64; 3]>>>>> {
        self.latest
            .lock()
            .map_err(|_| LedControlError::Poisoned("external frame buffer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_frame_wins() {
        let buffer = ExternalFrameBuffer::new();
        assert!(buffer.latest().unwrap().is_none());
        buffer.push_rgb(&[[1.0, 0.0, 0.0]]).unwrap();
        buffer.push_rgb(&[[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).unwrap();
        let latest = buffer.latest().unwrap().unwrap();
        assert_eq!(latest.as_slice(), &[[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        assert_eq!(buffer.generation(), 2);
    }

    #[test]
    fn dmx_bytes_are_grouped_into_pixels() {
        let buffer = ExternalFrameBuffer::new();
        buffer.push_dmx(&[255, 0, 51, 0, 255, 0, 7]).unwrap();
        let latest = buffer.latest().unwrap().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0], [1.0, 0.0, 0.2]);
        assert_eq!(latest[1], [0.0, 1.0, 0.0]);
    }
}
