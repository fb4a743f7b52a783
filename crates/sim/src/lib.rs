//! Simulated cryostat: a first-order thermal plant driven by heater
//! current, a noisy (optionally faulty) temperature sensor, and a `Rig`
//! that serves both over bus channels with a synthetic clock.

use std::sync::Mutex;

use bus::{BusError, Reading, Transport, TIMESTAMP_FIELD};
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use controller::calib::Pt100;
use controller::essc::{CurveError, PiecewiseCurve};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

#[derive(Clone, Copy, Debug)]
pub struct PlantParams {
    pub ambient_k: f64,
    pub thermal_mass: f64,
    /// Heating power per ampere, in kelvin-equivalents.
    pub k_heater: f64,
    pub k_loss: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            ambient_k: 77.0,
            thermal_mass: 120.0,
            k_heater: 900.0,
            k_loss: 20.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlantState {
    pub temp_k: f64,
    pub heater_a: f64,
}

impl Default for PlantState {
    fn default() -> Self {
        Self {
            temp_k: 77.0,
            heater_a: 0.0,
        }
    }
}

impl PlantState {
    /// Euler integration of
    /// dT/dt = (k_heater*heater - k_loss*(T-ambient)) / thermal_mass
    pub fn step(&mut self, p: &PlantParams, dt_s: f64) {
        let heat_in = p.k_heater * self.heater_a;
        let heat_out = p.k_loss * (self.temp_k - p.ambient_k);
        self.temp_k += (heat_in - heat_out) / p.thermal_mass * dt_s;

        if self.temp_k.is_nan() {
            self.temp_k = p.ambient_k;
        }
    }
}

/// Heater current that holds the plant at `sp_k` in steady state.
pub fn steady_state_current(p: &PlantParams, sp_k: f64) -> f64 {
    p.k_loss * (sp_k - p.ambient_k) / p.k_heater
}

/// Calibration curve for the feed-forward lookup, sampled from the plant
/// model between `lo_k` and `hi_k`.
pub fn steady_state_curve(p: &PlantParams, lo_k: f64, hi_k: f64) -> Result<PiecewiseCurve, CurveError> {
    let n = 6;
    let pts: Vec<(f64, f64)> = (0..n)
        .map(|i| {
            let sp = lo_k + (hi_k - lo_k) * i as f64 / (n - 1) as f64;
            (sp, steady_state_current(p, sp))
        })
        .collect();
    PiecewiseCurve::from_points(&pts, None)
}

#[derive(Clone, Copy, Debug)]
pub enum SensorFault {
    None,
    Stuck { value: f64 },
    Bias { value: f64 },
    Drift { per_s: f64 },
    DropoutEvery { n: u64 },
}

#[derive(Clone, Debug)]
pub struct Sensor {
    pub noise_std: f64,
    pub fault: SensorFault,
    /// Emit PT100 resistance instead of kelvin, for the conversion path.
    pub emit_resistance: Option<Pt100>,
    rng: StdRng,
    step_count: u64,
}

impl Sensor {
    pub fn new(seed: u64) -> Self {
        Self {
            noise_std: 0.02,
            fault: SensorFault::None,
            emit_resistance: None,
            rng: StdRng::seed_from_u64(seed),
            step_count: 0,
        }
    }

    pub fn read(&mut self, true_temp_k: f64, dt_s: f64) -> f64 {
        self.step_count += 1;

        let mut v = match self.fault {
            SensorFault::None => true_temp_k,
            SensorFault::Stuck { value } => value,
            SensorFault::Bias { value } => true_temp_k + value,
            SensorFault::Drift { per_s } => true_temp_k + per_s * (self.step_count as f64) * dt_s,
            SensorFault::DropoutEvery { n } => {
                if n > 0 && (self.step_count % n) == 0 {
                    return f64::NAN;
                }
                true_temp_k
            }
        };

        if self.noise_std > 0.0 && v.is_finite() {
            if let Ok(normal) = Normal::new(0.0, self.noise_std) {
                v += normal.sample(&mut self.rng);
            }
        }

        match self.emit_resistance {
            Some(cal) => cal.resistance_ohm(v),
            None => v,
        }
    }
}

struct RigInner {
    params: PlantParams,
    plant: PlantState,
    sensor: Sensor,
    clock: DateTime<Utc>,
    last_dt_s: f64,
    enabled: bool,
    /// Multiplier on the heater readback; 10.0 fakes a verify failure.
    readback_scale: f64,
    /// Input-channel reads left to fail, for poll-failure scenarios.
    failing_reads: u32,
    heater_commands: Vec<f64>,
    presets: Vec<(String, f64)>,
}

/// Serves the simulated cryostat over bus channels:
/// `cryo_temperature` (get), `heater_current` (set), the readback, and
/// `loop_enabled`. Unknown set channels are accepted as instrument
/// presets; unknown get channels error.
pub struct Rig {
    inner: Mutex<RigInner>,
}

pub const INPUT_CHANNEL: &str = "cryo_temperature";
pub const OUTPUT_CHANNEL: &str = "heater_current";
pub const CHECK_CHANNEL: &str = "heater_current_readback";
pub const STATUS_CHANNEL: &str = "loop_enabled";

impl Rig {
    pub fn new(params: PlantParams, sensor: Sensor) -> Self {
        Self {
            inner: Mutex::new(RigInner {
                params,
                plant: PlantState {
                    temp_k: params.ambient_k,
                    heater_a: 0.0,
                },
                sensor,
                clock: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                last_dt_s: 1.0,
                enabled: false,
                readback_scale: 1.0,
                failing_reads: 0,
                heater_commands: Vec::new(),
                presets: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RigInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Advance the synthetic clock and the plant.
    pub fn step(&self, dt_s: f64) {
        let mut g = self.lock();
        g.clock = g.clock + TimeDelta::milliseconds((dt_s * 1e3) as i64);
        g.last_dt_s = dt_s;
        let params = g.params;
        g.plant.step(&params, dt_s);
    }

    pub fn temp_k(&self) -> f64 {
        self.lock().plant.temp_k
    }

    pub fn heater_a(&self) -> f64 {
        self.lock().plant.heater_a
    }

    pub fn set_heater(&self, amps: f64) {
        self.lock().plant.heater_a = amps;
    }

    pub fn set_temp(&self, kelvin: f64) {
        self.lock().plant.temp_k = kelvin;
    }

    pub fn heater_commands(&self) -> Vec<f64> {
        self.lock().heater_commands.clone()
    }

    pub fn presets(&self) -> Vec<(String, f64)> {
        self.lock().presets.clone()
    }

    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn force_status(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn set_readback_scale(&self, scale: f64) {
        self.lock().readback_scale = scale;
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.lock().failing_reads = n;
    }

    pub fn set_fault(&self, fault: SensorFault) {
        self.lock().sensor.fault = fault;
    }
}

impl Transport for Rig {
    fn get(&self, channel: &str) -> Result<Reading, BusError> {
        let mut g = self.lock();
        match channel {
            INPUT_CHANNEL => {
                if g.failing_reads > 0 {
                    g.failing_reads -= 1;
                    return Err(BusError::Transport {
                        channel: channel.to_string(),
                        reason: "sensor offline".to_string(),
                    });
                }
                let temp = g.plant.temp_k;
                let dt = g.last_dt_s;
                let value = g.sensor.read(temp, dt);
                let stamp = g.clock.to_rfc3339();
                Ok(Reading::new()
                    .with_num("value", value)
                    .with_text(TIMESTAMP_FIELD, stamp))
            }
            CHECK_CHANNEL => Ok(Reading::new().with_num("value", g.plant.heater_a * g.readback_scale)),
            STATUS_CHANNEL => Ok(Reading::new().with_num("value", if g.enabled { 1.0 } else { 0.0 })),
            _ => Err(BusError::Transport {
                channel: channel.to_string(),
                reason: "unknown channel".to_string(),
            }),
        }
    }

    fn set(&self, channel: &str, value: f64) -> Result<Reading, BusError> {
        let mut g = self.lock();
        match channel {
            OUTPUT_CHANNEL => {
                g.plant.heater_a = value;
                g.heater_commands.push(value);
            }
            STATUS_CHANNEL => g.enabled = value == 1.0,
            _ => g.presets.push((channel.to_string(), value)),
        }
        Ok(Reading::new().with_num("value", value))
    }
}
