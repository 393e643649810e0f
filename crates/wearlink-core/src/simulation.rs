//! Synthetic physiological signals
//!
//! Used whenever a real channel is unavailable so consumers still receive a
//! continuous stream. The generator is a plain iterator over synthetic time
//! (`tick × tick_ms`); pacing it against a wall clock is the caller's job.
//!
//! # Signal models
//!
//! - Heart rate: bounded random walk in `[60, 100]` bpm, or a driver value
//! - PPG: `sin(t/300)·0.3 + 1.5 + noise`, SpO2 from [`derive_oxygen`]
//! - ECG: `sin(t/200)·50 + 500 + noise + (hr/60)·10` µV
//! - Battery: slow linear drain
//!
//! `t` is in milliseconds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::types::{
    now_us, BatterySample, EcgSample, HeartRateSample, Metric, PpgSample, Sample,
};

/// Lower bound of the heart rate random walk (bpm)
pub const HEART_RATE_MIN: u16 = 60;

/// Upper bound of the heart rate random walk (bpm)
pub const HEART_RATE_MAX: u16 = 100;

/// Largest single step of the random walk (bpm)
const HEART_RATE_STEP: i32 = 2;

/// Lowest simulated SpO2 (%)
pub const OXYGEN_MIN: u8 = 94;

/// Highest simulated SpO2 (%)
pub const OXYGEN_MAX: u8 = 99;

/// Ticks per one percent of simulated battery drain
const BATTERY_DRAIN_TICKS: u64 = 600;

/// Simulated battery never drops below this level
const BATTERY_FLOOR: u8 = 5;

/// Simulation configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Synthetic time between samples (ms)
    pub tick_ms: u64,
    /// Initial heart rate of the random walk (bpm)
    pub start_heart_rate: u16,
    /// Initial battery level (%)
    pub start_battery: u8,
    /// Fixed RNG seed for reproducible output
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            start_heart_rate: 75,
            start_battery: 85,
            seed: None,
        }
    }
}

/// SpO2 estimate from heart rate.
///
/// 98% nominal, sliding toward 94% above 100 bpm and settling at 97-99%
/// below 60 bpm. Always within `[OXYGEN_MIN, OXYGEN_MAX]`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn derive_oxygen(heart_rate: u16) -> u8 {
    let hr = f64::from(heart_rate);
    let oxygen = if hr > 100.0 {
        (98.0 - (hr - 100.0) / 20.0).max(94.0)
    } else if hr < 60.0 {
        (97.0 + (60.0 - hr) / 30.0).min(99.0)
    } else {
        98.0
    };

    oxygen
        .round()
        .clamp(f64::from(OXYGEN_MIN), f64::from(OXYGEN_MAX)) as u8
}

/// Lazy, infinite, restartable sample generator for one metric.
#[derive(Debug)]
pub struct Simulator {
    metric: Metric,
    driver: Option<u16>,
    config: SimulationConfig,
    rng: StdRng,
    tick: u64,
    heart_rate: u16,
    battery: u8,
    epoch_us: u64,
}

impl Simulator {
    /// Create a generator with default configuration.
    ///
    /// `driver_heart_rate` replaces the random walk when supplied.
    #[must_use]
    pub fn new(metric: Metric, driver_heart_rate: Option<u16>) -> Self {
        Self::with_config(metric, driver_heart_rate, SimulationConfig::default())
    }

    /// Create a generator with custom configuration.
    #[must_use]
    pub fn with_config(
        metric: Metric,
        driver_heart_rate: Option<u16>,
        config: SimulationConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let heart_rate = config
            .start_heart_rate
            .clamp(HEART_RATE_MIN, HEART_RATE_MAX);
        let battery = config.start_battery.min(100);

        Self {
            metric,
            driver: driver_heart_rate,
            config,
            rng,
            tick: 0,
            heart_rate,
            battery,
            epoch_us: now_us(),
        }
    }

    /// Metric this generator produces.
    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Replace (or clear) the driving heart rate.
    pub fn set_driver(&mut self, driver_heart_rate: Option<u16>) {
        self.driver = driver_heart_rate;
    }

    /// Rewind synthetic time and internal state.
    ///
    /// A seeded generator replays exactly the same sequence.
    pub fn restart(&mut self) {
        if let Some(seed) = self.config.seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self.tick = 0;
        self.heart_rate = self
            .config
            .start_heart_rate
            .clamp(HEART_RATE_MIN, HEART_RATE_MAX);
        self.battery = self.config.start_battery.min(100);
        self.epoch_us = now_us();
    }

    /// Number of samples produced since the last (re)start.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Heart rate for the current tick: the driver, or one random walk step.
    fn step_heart_rate(&mut self) -> u16 {
        if let Some(driver) = self.driver {
            return driver;
        }

        let step = self.rng.random_range(-HEART_RATE_STEP..=HEART_RATE_STEP);
        let next = (i32::from(self.heart_rate) + step)
            .clamp(i32::from(HEART_RATE_MIN), i32::from(HEART_RATE_MAX));
        self.heart_rate = u16::try_from(next).unwrap_or(HEART_RATE_MIN);
        self.heart_rate
    }

    /// Uniform noise in `[-half_width, half_width)`.
    fn noise(&mut self, half_width: f64) -> f64 {
        (self.rng.random::<f64>() - 0.5) * 2.0 * half_width
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn sample_at(&mut self, t_ms: f64, timestamp_us: u64) -> Sample {
        match self.metric {
            Metric::HeartRate => Sample::HeartRate(HeartRateSample {
                bpm: self.step_heart_rate(),
                timestamp_us,
            }),
            Metric::Ppg => {
                let hr = self.step_heart_rate();
                let amplitude = (t_ms / 300.0).sin() * 0.3 + 1.5 + self.noise(0.05);
                Sample::Ppg(PpgSample {
                    amplitude: amplitude as f32,
                    derived_heart_rate: Some(hr),
                    derived_oxygen: Some(derive_oxygen(hr)),
                    timestamp_us,
                })
            }
            Metric::Ecg => {
                let hr = self.step_heart_rate();
                let heart_rate_factor = f64::from(hr) / 60.0;
                let value = (t_ms / 200.0).sin() * 50.0
                    + 500.0
                    + self.noise(10.0)
                    + heart_rate_factor * 10.0;
                Sample::Ecg(EcgSample {
                    microvolts: value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX))
                        as i16,
                    timestamp_us,
                })
            }
            Metric::Battery => {
                if self.tick > 0 && self.tick % BATTERY_DRAIN_TICKS == 0 {
                    self.battery = self.battery.saturating_sub(1).max(BATTERY_FLOOR);
                }
                Sample::Battery(BatterySample {
                    percent: self.battery,
                    timestamp_us,
                })
            }
        }
    }
}

impl Iterator for Simulator {
    type Item = Sample;

    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> Option<Sample> {
        let offset_ms = self.tick.saturating_mul(self.config.tick_ms);
        let timestamp_us = self.epoch_us.saturating_add(offset_ms.saturating_mul(1000));
        let sample = self.sample_at(offset_ms as f64, timestamp_us);
        self.tick += 1;
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(metric: Metric, driver: Option<u16>) -> Simulator {
        Simulator::with_config(
            metric,
            driver,
            SimulationConfig {
                seed: Some(7),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_oxygen_bounds() {
        for hr in 40..=180 {
            let o2 = derive_oxygen(hr);
            assert!((OXYGEN_MIN..=OXYGEN_MAX).contains(&o2), "hr {hr} -> {o2}");
        }
        // Extremes outside the physiological range stay clamped too
        assert_eq!(derive_oxygen(0), 99);
        assert_eq!(derive_oxygen(u16::MAX), 94);
    }

    #[test]
    fn test_oxygen_reference_points() {
        assert_eq!(derive_oxygen(75), 98);
        assert_eq!(derive_oxygen(100), 98);
        assert_eq!(derive_oxygen(140), 96);
        assert_eq!(derive_oxygen(180), 94);
        assert_eq!(derive_oxygen(30), 98);
        assert_eq!(derive_oxygen(45), 98);
    }

    #[test]
    fn test_heart_rate_walk_bounded() {
        let sim = seeded(Metric::HeartRate, None);
        let mut prev: Option<u16> = None;
        for sample in sim.take(5_000) {
            let Sample::HeartRate(s) = sample else {
                panic!("wrong metric");
            };
            assert!((HEART_RATE_MIN..=HEART_RATE_MAX).contains(&s.bpm));
            if let Some(p) = prev {
                assert!(s.bpm.abs_diff(p) <= 2);
            }
            prev = Some(s.bpm);
        }
    }

    #[test]
    fn test_driver_overrides_walk() {
        let sim = seeded(Metric::HeartRate, Some(130));
        assert!(sim
            .take(10)
            .all(|s| matches!(s, Sample::HeartRate(HeartRateSample { bpm: 130, .. }))));
    }

    #[test]
    fn test_ppg_uses_driver_for_oxygen() {
        let mut sim = seeded(Metric::Ppg, Some(140));
        let Some(Sample::Ppg(s)) = sim.next() else {
            panic!("expected PPG");
        };
        assert_eq!(s.derived_heart_rate, Some(140));
        assert_eq!(s.derived_oxygen, Some(96));
        assert!((1.15..=1.85).contains(&s.amplitude));
    }

    #[test]
    fn test_ecg_range() {
        for sample in seeded(Metric::Ecg, None).take(2_000) {
            let Sample::Ecg(s) = sample else {
                panic!("wrong metric");
            };
            // 500 ± 50 ± 10, plus 10..=16.7 from the heart rate
            assert!((450..=577).contains(&s.microvolts), "{}", s.microvolts);
        }
    }

    #[test]
    fn test_battery_drains_slowly() {
        let samples: Vec<_> = seeded(Metric::Battery, None).take(1_201).collect();
        let first = match samples[0] {
            Sample::Battery(s) => s.percent,
            _ => unreachable!(),
        };
        let last = match samples[1_200] {
            Sample::Battery(s) => s.percent,
            _ => unreachable!(),
        };
        assert_eq!(first, 85);
        assert_eq!(last, 83);
    }

    #[test]
    fn test_timestamps_advance_by_tick() {
        let mut sim = seeded(Metric::Ecg, None);
        let a = sim.next().unwrap().timestamp_us();
        let b = sim.next().unwrap().timestamp_us();
        assert_eq!(b - a, 100_000);
    }

    #[test]
    fn test_restart_replays_seeded_sequence() {
        let mut sim = seeded(Metric::HeartRate, None);
        let first: Vec<u16> = sim
            .by_ref()
            .take(50)
            .map(|s| match s {
                Sample::HeartRate(h) => h.bpm,
                _ => unreachable!(),
            })
            .collect();

        sim.restart();
        assert_eq!(sim.ticks(), 0);

        let second: Vec<u16> = sim
            .take(50)
            .map(|s| match s {
                Sample::HeartRate(h) => h.bpm,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(first, second);
    }
}
