pub mod calib;
pub mod essc;

use essc::SteadyState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("output bounds are flipped: u_min {0} > u_max {1}")]
    FlippedBounds(f64, f64),
    #[error("{0} must be non-negative, got {1}")]
    Negative(&'static str, f64),
    #[error("{0} must be positive, got {1}")]
    NonPositive(&'static str, f64),
    #[error("derivative smoothing must be in [0, 1], got {0}")]
    BadSmoothing(f64),
    #[error("feed-forward band is inverted: rel_lo {0} > rel_hi {1}")]
    InvertedBand(f64, f64),
}

/// When to step straight to the modelled steady-state command instead of
/// the PID-composed change: setpoint at least `sp_min` and relative error
/// inside `[rel_lo, rel_hi]`.
#[derive(Clone, Copy, Debug)]
pub struct FeedForwardPolicy {
    pub sp_min: f64,
    pub rel_lo: f64,
    pub rel_hi: f64,
}

impl Default for FeedForwardPolicy {
    fn default() -> Self {
        Self {
            sp_min: 0.0,
            rel_lo: 0.05,
            rel_hi: 0.20,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub u_min: f64,
    pub u_max: f64,
    /// Smallest command change worth writing to the actuator.
    pub delta_out_min: f64,
    pub integral_limit: Option<f64>,
    /// EMA coefficient for d(PV)/dt; 0 uses the raw difference quotient.
    pub derivative_smoothing: f64,
    pub enable_offset_term: bool,
    pub u_offset_baseline: f64,
    /// Observed PV noise band at steady state; the D term is attenuated
    /// to `d_attenuation_floor` of its nominal value inside it.
    pub noise_band: f64,
    pub d_attenuation_floor: f64,
    /// |d|e|/dt| above which error-velocity braking engages, PV units/s.
    pub brake_trigger: f64,
    pub brake_floor: f64,
    pub brake_band: f64,
    pub brake_power: i32,
    /// Maximum |du|/dt the actuator may be commanded at.
    pub ramp_rate_limit: f64,
    /// Cap on dt before composition. Inherited from the original loop;
    /// bounds integral growth after a long gap between samples.
    pub dt_ceiling: Option<f64>,
    pub feed_forward: Option<FeedForwardPolicy>,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.02,
            kd: 0.0,
            u_min: 0.0,
            u_max: 10.0,
            delta_out_min: 0.001,
            integral_limit: Some(500.0),
            derivative_smoothing: 0.0,
            enable_offset_term: false,
            u_offset_baseline: 0.0,
            noise_band: 0.05,
            d_attenuation_floor: 0.01,
            brake_trigger: 1.0,
            brake_floor: 0.02,
            brake_band: 10.0,
            brake_power: 2,
            ramp_rate_limit: 2.0 / 60.0,
            dt_ceiling: Some(6.0),
            feed_forward: None,
        }
    }
}

impl PidConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.u_min > self.u_max {
            return Err(ConfigError::FlippedBounds(self.u_min, self.u_max));
        }
        if self.delta_out_min < 0.0 {
            return Err(ConfigError::Negative("delta_out_min", self.delta_out_min));
        }
        if let Some(lim) = self.integral_limit {
            if lim < 0.0 {
                return Err(ConfigError::Negative("integral_limit", lim));
            }
        }
        if !(0.0..=1.0).contains(&self.derivative_smoothing) {
            return Err(ConfigError::BadSmoothing(self.derivative_smoothing));
        }
        if self.noise_band <= 0.0 {
            return Err(ConfigError::NonPositive("noise_band", self.noise_band));
        }
        if self.brake_band <= 0.0 {
            return Err(ConfigError::NonPositive("brake_band", self.brake_band));
        }
        if self.brake_power <= 0 {
            return Err(ConfigError::NonPositive("brake_power", self.brake_power as f64));
        }
        if self.ramp_rate_limit <= 0.0 {
            return Err(ConfigError::NonPositive("ramp_rate_limit", self.ramp_rate_limit));
        }
        if let Some(cap) = self.dt_ceiling {
            if cap <= 0.0 {
                return Err(ConfigError::NonPositive("dt_ceiling", cap));
            }
        }
        if let Some(ff) = self.feed_forward {
            if ff.rel_lo < 0.0 {
                return Err(ConfigError::Negative("rel_lo", ff.rel_lo));
            }
            if ff.rel_lo > ff.rel_hi {
                return Err(ConfigError::InvertedBand(ff.rel_lo, ff.rel_hi));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Terms {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    /// Change too small to act on; the actuator keeps its last value.
    Hold,
    Write(f64),
}

#[derive(Clone, Copy, Debug)]
pub struct StepInput {
    pub sp: f64,
    pub pv: f64,
    pub prev_pv: f64,
    pub dt: f64,
    pub old_u: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct StepOutput {
    pub command: Command,
    pub terms: Terms,
    /// Shaped command change; for `Write` this is the change actually applied.
    pub delta: f64,
}

pub struct Pid {
    cfg: PidConfig,
    integral: f64,
    ema_dpvdt: f64,
    prev_abs_err: Option<f64>,
    steady_state: Option<Box<dyn SteadyState + Send>>,
}

impl Pid {
    pub fn new(cfg: PidConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            integral: 0.0,
            ema_dpvdt: 0.0,
            prev_abs_err: None,
            steady_state: None,
        })
    }

    /// A controller whose feed-forward band steps to `curve.u_ss(sp)`
    /// instead of the PID-composed change.
    pub fn with_feed_forward(
        cfg: PidConfig,
        curve: Box<dyn SteadyState + Send>,
    ) -> Result<Self, ConfigError> {
        let mut pid = Self::new(cfg)?;
        pid.steady_state = Some(curve);
        Ok(pid)
    }

    pub fn cfg(&self) -> &PidConfig {
        &self.cfg
    }

    pub fn set_kp(&mut self, kp: f64) {
        self.cfg.kp = kp;
    }

    pub fn set_ki(&mut self, ki: f64) {
        self.cfg.ki = ki;
    }

    pub fn set_kd(&mut self, kd: f64) {
        self.cfg.kd = kd;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset_integral(&mut self) {
        self.integral = 0.0;
    }

    /// Compose and shape one control step. Returns a saturated write or a
    /// hold when the shaped change falls inside the output deadband.
    pub fn step(&mut self, input: StepInput) -> StepOutput {
        let StepInput {
            sp,
            pv,
            prev_pv,
            dt,
            old_u,
        } = input;
        let dt = match self.cfg.dt_ceiling {
            Some(cap) => dt.min(cap),
            None => dt,
        };
        let e = sp - pv;

        self.integral += e * dt;
        self.clamp_integral();

        // Derivative on the measurement, so a setpoint step does not kick D.
        let raw_d = (pv - prev_pv) / dt;
        let d_est = if self.cfg.derivative_smoothing > 0.0 {
            let a = self.cfg.derivative_smoothing;
            self.ema_dpvdt = a * self.ema_dpvdt + (1.0 - a) * raw_d;
            self.ema_dpvdt
        } else {
            raw_d
        };

        let terms = Terms {
            p: self.cfg.kp * e,
            i: self.cfg.ki * self.integral,
            d: self.cfg.kd * d_est * self.proximity_attenuation(e),
        };

        let baseline = if self.cfg.enable_offset_term { old_u } else { 0.0 }
            + self.cfg.u_offset_baseline;
        // d(e)/dt = -d(PV)/dt, hence the minus sign on D.
        let u_raw = baseline + terms.p + terms.i - terms.d;
        let mut delta = u_raw - old_u;

        if let (Some(policy), Some(curve)) = (self.cfg.feed_forward, self.steady_state.as_deref()) {
            let rel_err = if sp != 0.0 { (e / sp).abs() } else { e.abs() };
            if sp >= policy.sp_min && rel_err >= policy.rel_lo && rel_err <= policy.rel_hi {
                // Close enough to know which side of SP we are on, far
                // enough that pure PID would wind up.
                delta = curve.u_ss(sp) - old_u;
            }
        }

        let abs_err = e.abs();
        if let Some(prev) = self.prev_abs_err {
            if ((abs_err - prev) / dt).abs() > self.cfg.brake_trigger {
                delta *= self.brake_factor(e);
            }
        }
        self.prev_abs_err = Some(abs_err);

        let max_step = self.cfg.ramp_rate_limit * dt;
        delta = delta.clamp(-max_step, max_step);

        if delta.abs() < self.cfg.delta_out_min {
            return StepOutput {
                command: Command::Hold,
                terms,
                delta,
            };
        }

        let u = old_u + delta;
        let u_sat = u.clamp(self.cfg.u_min, self.cfg.u_max);
        if u_sat != u && self.cfg.ki > 0.0 {
            // Back-calculation: bleed the integral by the saturation excess.
            self.integral += (u_sat - u) / self.cfg.ki;
            self.clamp_integral();
        }

        StepOutput {
            command: Command::Write(u_sat),
            terms,
            delta: u_sat - old_u,
        }
    }

    fn clamp_integral(&mut self) {
        if let Some(lim) = self.cfg.integral_limit {
            self.integral = self.integral.clamp(-lim, lim);
        }
    }

    /// Soft gate on D: ~`d_attenuation_floor` inside the noise band, 1 far
    /// outside. The sextic denominator keeps the command differentiable.
    fn proximity_attenuation(&self, e: f64) -> f64 {
        let rho = self.cfg.d_attenuation_floor;
        1.0 - (1.0 - rho) / (1.0 + (e / self.cfg.noise_band).powi(6))
    }

    fn brake_factor(&self, e: f64) -> f64 {
        let b = self.cfg.brake_floor;
        1.0 - (1.0 - b) / (1.0 + (e / self.cfg.brake_band).powi(self.cfg.brake_power))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Wide bounds, no deadband, no ramp pressure, so single shaping stages
    // can be exercised in isolation.
    fn open_cfg() -> PidConfig {
        PidConfig {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            u_min: -1000.0,
            u_max: 1000.0,
            delta_out_min: 0.0,
            integral_limit: None,
            ramp_rate_limit: f64::INFINITY,
            ..Default::default()
        }
    }

    fn step_once(pid: &mut Pid, sp: f64, pv: f64, prev_pv: f64, dt: f64, old_u: f64) -> StepOutput {
        pid.step(StepInput {
            sp,
            pv,
            prev_pv,
            dt,
            old_u,
        })
    }

    fn written(out: &StepOutput) -> f64 {
        match out.command {
            Command::Write(u) => u,
            Command::Hold => panic!("expected a write, got a hold"),
        }
    }

    #[test]
    fn deadband_holds_small_changes() {
        let cfg = PidConfig {
            delta_out_min: 0.5,
            ..open_cfg()
        };
        let mut pid = Pid::new(cfg).unwrap();
        let out = step_once(&mut pid, 10.0, 9.9, 9.9, 1.0, 2.0);
        assert_eq!(out.command, Command::Hold);
        assert!(out.delta.abs() < 0.5);
    }

    #[test]
    fn ramp_limit_caps_the_step() {
        let cfg = PidConfig {
            kp: 10.0,
            ramp_rate_limit: 0.1,
            ..open_cfg()
        };
        let mut pid = Pid::new(cfg).unwrap();
        let out = step_once(&mut pid, 100.0, 50.0, 50.0, 1.0, 0.0);
        assert!((written(&out) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn saturation_back_calculates_the_integral() {
        // Kp=2, Ki=1, u_max=5, SP=100, PV=50, old_u=4.9: the composed output
        // saturates hard and the integral must end at -99.9.
        let cfg = PidConfig {
            kp: 2.0,
            ki: 1.0,
            kd: 0.0,
            u_min: 0.0,
            u_max: 5.0,
            enable_offset_term: true,
            ..open_cfg()
        };
        let mut pid = Pid::new(cfg).unwrap();
        let out = step_once(&mut pid, 100.0, 50.0, 50.0, 1.0, 4.9);
        assert_eq!(out.command, Command::Write(5.0));
        assert!(
            (pid.integral() - (-99.9)).abs() < 1e-9,
            "integral = {}",
            pid.integral()
        );

        // Next tick the plant has moved; the integral must relax toward zero
        // instead of winding further.
        let before = pid.integral().abs();
        step_once(&mut pid, 100.0, 90.0, 50.0, 1.0, 5.0);
        assert!(pid.integral().abs() < before);
    }

    #[test]
    fn integral_limit_clamps() {
        let cfg = PidConfig {
            ki: 1.0,
            integral_limit: Some(3.0),
            ..open_cfg()
        };
        let mut pid = Pid::new(cfg).unwrap();
        for _ in 0..10 {
            step_once(&mut pid, 10.0, 0.0, 0.0, 1.0, 0.0);
        }
        assert!(pid.integral() <= 3.0);
    }

    #[test]
    fn derivative_is_attenuated_near_the_setpoint() {
        let cfg = PidConfig {
            kp: 0.0,
            kd: 10.0,
            noise_band: 0.05,
            ..open_cfg()
        };
        let mut pid = Pid::new(cfg).unwrap();
        // PV swings 0.06 K in one second just under the setpoint.
        let out = step_once(&mut pid, 100.0, 99.97, 99.91, 1.0, 0.0);
        let nominal = 10.0 * 0.06;
        assert!(out.terms.d.abs() < nominal, "D not attenuated: {}", out.terms.d);
        assert!(out.terms.d.abs() > 0.0, "D fully suppressed");

        // Far from the setpoint the gate is open.
        let mut pid = Pid::new(cfg).unwrap();
        let out = step_once(&mut pid, 100.0, 50.06, 50.0, 1.0, 0.0);
        assert!((out.terms.d - nominal).abs() < 0.05 * nominal);
    }

    #[test]
    fn feed_forward_applies_only_inside_the_band() {
        let cfg = PidConfig {
            kp: 0.5,
            ki: 0.02,
            feed_forward: Some(FeedForwardPolicy::default()),
            ..open_cfg()
        };

        // rel_err = 8% -> in band, step straight toward u_ss.
        let mut pid = Pid::with_feed_forward(cfg, Box::new(|_sp: f64| 3.68)).unwrap();
        let out = step_once(&mut pid, 100.0, 92.0, 92.0, 1.0, 1.0);
        assert!((written(&out) - 3.68).abs() < 1e-12);

        // rel_err = 2% -> below the band, plain PID.
        let mut pid = Pid::with_feed_forward(cfg, Box::new(|_sp: f64| 3.68)).unwrap();
        let out = step_once(&mut pid, 100.0, 98.0, 98.0, 1.0, 1.0);
        if let Command::Write(u) = out.command {
            assert!((u - 3.68).abs() > 1e-6);
        }

        // rel_err = 50% -> above the band, plain PID.
        let mut pid = Pid::with_feed_forward(cfg, Box::new(|_sp: f64| 3.68)).unwrap();
        let out = step_once(&mut pid, 100.0, 50.0, 50.0, 1.0, 1.0);
        if let Command::Write(u) = out.command {
            assert!((u - 3.68).abs() > 1e-6);
        }
    }

    #[test]
    fn braking_scales_the_change_on_fast_error_collapse() {
        let cfg = PidConfig {
            kp: 1.0,
            ..open_cfg()
        };
        // Reference run with braking effectively disabled.
        let mut free = Pid::new(PidConfig {
            brake_trigger: f64::INFINITY,
            ..cfg
        })
        .unwrap();
        step_once(&mut free, 100.0, 80.0, 80.0, 1.0, 0.0);
        let unbraked = written(&step_once(&mut free, 100.0, 95.0, 80.0, 1.0, 0.0));

        // Same history with the default trigger: |e| collapses 20 -> 5 in one
        // second, so the change is scaled by beta(e=5).
        let mut pid = Pid::new(cfg).unwrap();
        step_once(&mut pid, 100.0, 80.0, 80.0, 1.0, 0.0);
        let braked = written(&step_once(&mut pid, 100.0, 95.0, 80.0, 1.0, 0.0));
        let beta = 1.0 - (1.0 - 0.02) / (1.0 + (5.0_f64 / 10.0).powi(2));
        assert!((braked - unbraked * beta).abs() < 1e-9);
    }

    #[test]
    fn dt_ceiling_caps_integral_growth() {
        let cfg = PidConfig {
            kp: 0.0,
            ki: 1.0,
            dt_ceiling: Some(6.0),
            ..open_cfg()
        };
        let mut pid = Pid::new(cfg).unwrap();
        step_once(&mut pid, 10.0, 0.0, 0.0, 600.0, 0.0);
        assert!((pid.integral() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_configs_fail_construction() {
        assert!(Pid::new(PidConfig {
            u_min: 1.0,
            u_max: 0.0,
            ..Default::default()
        })
        .is_err());
        assert!(Pid::new(PidConfig {
            delta_out_min: -0.1,
            ..Default::default()
        })
        .is_err());
        assert!(Pid::new(PidConfig {
            derivative_smoothing: 1.5,
            ..Default::default()
        })
        .is_err());
        assert!(Pid::new(PidConfig {
            feed_forward: Some(FeedForwardPolicy {
                sp_min: 0.0,
                rel_lo: 0.3,
                rel_hi: 0.1,
            }),
            ..Default::default()
        })
        .is_err());
    }
}
