//! Lock-free rolling level meter.
//!
//! Written from the audio thread, read from anywhere. Values are stored as `f32` bits in
//! atomics, so neither side ever blocks; a reader may observe a slightly stale value.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct LevelMeter {
    /// Smoothed RMS level, 0.0..=1.0, as `f32` bits.
    level: AtomicU32,
    /// Weight given to the newest block (exponential moving average).
    smoothing: f32,
}

impl LevelMeter {
    /// `smoothing` is clamped to `0.01..=1.0`; 1.0 disables smoothing.
    pub fn new(smoothing: f32) -> Self {
        Self {
            level: AtomicU32::new(0f32.to_bits()),
            smoothing: smoothing.clamp(0.01, 1.0),
        }
    }

    /// Fold a block of samples into the rolling estimate.
    pub fn observe(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let energy: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        let rms = (energy / samples.len() as f64).sqrt() as f32;

        let previous = f32::from_bits(self.level.load(Ordering::Relaxed));
        let next = previous + (rms - previous) * self.smoothing;
        self.level.store(next.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Current normalized level in `0.0..=1.0`.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_reads_zero() {
        let meter = LevelMeter::new(1.0);
        meter.observe(&[0; 128]);
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_full_scale_square_wave_reads_near_one() {
        let meter = LevelMeter::new(1.0);
        let block: Vec<i16> = (0..256).map(|i| if i % 2 == 0 { i16::MAX } else { -i16::MAX }).collect();
        meter.observe(&block);
        assert!(meter.level() > 0.99);
    }

    #[test]
    fn test_smoothing_moves_gradually() {
        let meter = LevelMeter::new(0.5);
        meter.observe(&[i16::MAX; 64]);
        let first = meter.level();
        meter.observe(&[i16::MAX; 64]);
        assert!(first < meter.level());
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }
}
