//! Process-wide sample rate and the oscillators that read it
//!
//! The audio domain publishes its stream rate here when it starts, so
//! generators built anywhere in the app pick up the real rate without being
//! handed a reference to the domain.

use portable_atomic::AtomicF64;
use std::f64::consts::TAU;
use std::sync::atomic::Ordering;

pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

static GLOBAL_SAMPLE_RATE: AtomicF64 = AtomicF64::new(DEFAULT_SAMPLE_RATE);

/// Sample rate of the most recently started audio stream.
pub fn global() -> f64 {
    GLOBAL_SAMPLE_RATE.load(Ordering::Relaxed)
}

/// Publish a new process sample rate. Non-positive values are ignored.
pub fn set_global(rate: f64) {
    if rate > 0.0 && rate.is_finite() {
        GLOBAL_SAMPLE_RATE.store(rate, Ordering::Relaxed);
    }
}

/// Ramp oscillator producing phase in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct Phasor {
    freq: f64,
    phase: f64,
    /// Fixed rate; `None` follows [`global`]
    rate: Option<f64>,
}

impl Phasor {
    pub fn new(freq: f64) -> Self {
        Self {
            freq,
            phase: 0.0,
            rate: None,
        }
    }

    /// A phasor pinned to `rate` instead of the process rate.
    pub fn with_sample_rate(freq: f64, rate: f64) -> Self {
        Self {
            freq,
            phase: 0.0,
            rate: Some(rate),
        }
    }

    pub fn set_freq(&mut self, freq: f64) {
        self.freq = freq;
    }

    pub fn freq(&self) -> f64 {
        self.freq
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Current phase, then advance by one sample.
    pub fn next_sample(&mut self) -> f64 {
        let out = self.phase;
        let rate = self.rate.unwrap_or_else(global);
        self.phase = (self.phase + self.freq / rate).rem_euclid(1.0);
        out
    }
}

/// Sine oscillator driven by a [`Phasor`].
#[derive(Debug, Clone)]
pub struct Sine {
    phasor: Phasor,
    amp: f32,
}

impl Sine {
    pub fn new(freq: f64, amp: f32) -> Self {
        Self {
            phasor: Phasor::new(freq),
            amp,
        }
    }

    pub fn with_sample_rate(freq: f64, amp: f32, rate: f64) -> Self {
        Self {
            phasor: Phasor::with_sample_rate(freq, rate),
            amp,
        }
    }

    pub fn set_freq(&mut self, freq: f64) {
        self.phasor.set_freq(freq);
    }

    pub fn next_sample(&mut self) -> f32 {
        (TAU * self.phasor.next_sample()).sin() as f32 * self.amp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_global_rejects_nonsense() {
        set_global(DEFAULT_SAMPLE_RATE);
        set_global(0.0);
        set_global(-1.0);
        set_global(f64::NAN);
        assert_eq!(global(), DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_phasor_wraps() {
        let mut p = Phasor::with_sample_rate(1.0, 4.0);
        let phases: Vec<f64> = (0..6).map(|_| p.next_sample()).collect();
        assert_eq!(phases, vec![0.0, 0.25, 0.5, 0.75, 0.0, 0.25]);
    }

    #[test]
    fn test_sine_quarter_period_peaks() {
        let mut s = Sine::with_sample_rate(1.0, 0.5, 4.0);
        let first = s.next_sample();
        let second = s.next_sample();
        assert!(first.abs() < 1e-6);
        assert!((second - 0.5).abs() < 1e-6);
    }
}
