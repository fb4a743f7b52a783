//! Measurement-driven PID loop over channel I/O.
//!
//! A PV sample enters through `ingest` (pushed by the host) or the
//! `Poller` (fixed cadence); the loop composes a command, shapes it,
//! writes it through the deadline-bounded client, verifies the readback,
//! and appends a trace row. Samples, not wall time, drive the loop.

mod poll;
mod trace;

pub use poll::Poller;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bus::{BusError, DeadlineClient, Reading, Transport, TIMESTAMP_FIELD};
use chrono::{DateTime, Utc};
use controller::calib::Pt100;
use controller::essc::SteadyState;
use controller::{Command, Pid, PidConfig, StepInput, Terms};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("invalid controller configuration: {0}")]
    Controller(#[from] controller::ConfigError),
    #[error("invalid loop configuration: {0} must be non-negative, got {1}")]
    Negative(&'static str, f64),
    #[error("invalid loop configuration: trace_flush_rows must be at least 1")]
    ZeroFlush,
    #[error("activation is only legal from INIT, state is {0:?}")]
    BadState(LoopState),
    #[error("activation failed: {0}")]
    Activation(BusError),
    #[error("status channel {0} does not report enabled")]
    NotEnabled(String),
}

#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub input_channel: String,
    pub output_channel: String,
    pub check_channel: String,
    pub status_channel: String,
    /// Field of an inbound payload carrying the numeric reading.
    pub payload_field: String,
    pub setpoint: f64,
    /// Absolute tolerance for set-and-verify readback.
    pub tolerance: f64,
    /// Seconds between accepted samples.
    pub minimum_elapsed_time: f64,
    /// Upper bound on readback polling after a write.
    pub max_settle_wait: Duration,
    pub settle_poll: Duration,
    /// Wall-clock deadline for every get/set on the bus.
    pub io_timeout: Duration,
    pub auto_mode: bool,
    /// Convert inbound readings from sensor resistance to kelvin.
    pub conversion: Option<Pt100>,
    /// Actuator pre-conditions applied at activation, e.g. a voltage limit.
    pub preconditions: Vec<(String, f64)>,
    /// Directory for the CSV trace; `None` disables persistence.
    pub trace_dir: Option<PathBuf>,
    pub trace_flush_rows: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            input_channel: "cryo_temperature".to_string(),
            output_channel: "heater_current".to_string(),
            check_channel: "heater_current_readback".to_string(),
            status_channel: "loop_enabled".to_string(),
            payload_field: "value".to_string(),
            setpoint: 0.0,
            tolerance: 0.05,
            minimum_elapsed_time: 1.0,
            max_settle_wait: Duration::from_secs(10),
            settle_poll: Duration::from_millis(500),
            io_timeout: Duration::from_secs(2),
            auto_mode: true,
            conversion: None,
            preconditions: Vec::new(),
            trace_dir: None,
            trace_flush_rows: 10,
        }
    }
}

impl LoopConfig {
    fn validate(&self) -> Result<(), LoopError> {
        if self.tolerance < 0.0 {
            return Err(LoopError::Negative("tolerance", self.tolerance));
        }
        if self.minimum_elapsed_time < 0.0 {
            return Err(LoopError::Negative(
                "minimum_elapsed_time",
                self.minimum_elapsed_time,
            ));
        }
        if self.trace_flush_rows == 0 {
            return Err(LoopError::ZeroFlush);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Ready,
    Active,
    Manual,
    Stopped,
}

/// Scalar telemetry sink. Publication failures never affect the control
/// path; the loop logs them at debug and moves on.
pub trait Telemetry: Send {
    fn publish(&self, name: &str, value: f64) -> Result<(), BusError>;
}

impl<F> Telemetry for F
where
    F: Fn(&str, f64) -> Result<(), BusError> + Send,
{
    fn publish(&self, name: &str, value: f64) -> Result<(), BusError> {
        self(name, value)
    }
}

/// Publishes telemetry as writes to bus channels under a prefix, so the
/// values can be plotted like any other sensor.
pub struct BusTelemetry {
    client: DeadlineClient,
    prefix: String,
}

impl BusTelemetry {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, prefix: impl Into<String>) -> Self {
        Self {
            client: DeadlineClient::new(transport, timeout),
            prefix: prefix.into(),
        }
    }
}

impl Telemetry for BusTelemetry {
    fn publish(&self, name: &str, value: f64) -> Result<(), BusError> {
        self.client
            .set(&format!("{}.{name}", self.prefix), value)
            .map(|_| ())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKey {
    PTerm,
    ITerm,
    DTerm,
    ChangeToCurrent,
    OldU,
    Integral,
}

/// Control-surface request, callable over the messaging bus.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    SetTarget(f64),
    GetTarget,
    SetKp(f64),
    SetKi(f64),
    SetKd(f64),
    GetKp,
    GetKi,
    GetKd,
    SetAutoMode(bool),
    Get(TelemetryKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    Ok,
    Value(f64),
    Flag(bool),
}

pub struct PidLoop {
    cfg: LoopConfig,
    pid: Pid,
    io: DeadlineClient,
    telemetry: Option<Box<dyn Telemetry>>,
    trace: trace::Trace,
    state: LoopState,
    setpoint: f64,
    old_u: f64,
    last_sample: Option<(f64, DateTime<Utc>)>,
    force_reprocess: bool,
    first_run: bool,
    last_terms: Terms,
    last_delta: f64,
    dropped_samples: u64,
}

impl PidLoop {
    pub fn new(
        cfg: LoopConfig,
        pid_cfg: PidConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, LoopError> {
        let pid = Pid::new(pid_cfg)?;
        Self::assemble(cfg, pid, transport)
    }

    pub fn with_feed_forward(
        cfg: LoopConfig,
        pid_cfg: PidConfig,
        transport: Arc<dyn Transport>,
        curve: Box<dyn SteadyState + Send>,
    ) -> Result<Self, LoopError> {
        let pid = Pid::with_feed_forward(pid_cfg, curve)?;
        Self::assemble(cfg, pid, transport)
    }

    fn assemble(cfg: LoopConfig, pid: Pid, transport: Arc<dyn Transport>) -> Result<Self, LoopError> {
        cfg.validate()?;
        let io = DeadlineClient::new(transport, cfg.io_timeout);
        let trace = trace::Trace::new(cfg.trace_dir.as_deref(), cfg.trace_flush_rows, Utc::now());
        let setpoint = cfg.setpoint;
        Ok(Self {
            cfg,
            pid,
            io,
            telemetry: None,
            trace,
            state: LoopState::Init,
            setpoint,
            old_u: 0.0,
            last_sample: None,
            force_reprocess: false,
            first_run: true,
            last_terms: Terms::default(),
            last_delta: 0.0,
            dropped_samples: 0,
        })
    }

    pub fn set_telemetry(&mut self, telemetry: Box<dyn Telemetry>) {
        self.telemetry = Some(telemetry);
    }

    /// Routing key the host should subscribe for push-mode ingest.
    pub fn routing_key(&self) -> String {
        format!("sensor_value.{}", self.cfg.input_channel)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn target(&self) -> f64 {
        self.setpoint
    }

    pub fn old_u(&self) -> f64 {
        self.old_u
    }

    pub fn integral(&self) -> f64 {
        self.pid.integral()
    }

    pub fn terms(&self) -> Terms {
        self.last_terms
    }

    pub fn change_to_current(&self) -> f64 {
        self.last_delta
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    pub fn trace_rows(&self) -> u64 {
        self.trace.rows_total()
    }

    /// Mutating the setpoint zeroes the integral and forces the next
    /// sample through the min-interval gate.
    pub fn set_target(&mut self, value: f64) {
        self.setpoint = value;
        self.pid.reset_integral();
        self.force_reprocess = true;
        info!("setpoint changed to {value:.3}");
    }

    pub fn kp(&self) -> f64 {
        self.pid.cfg().kp
    }

    pub fn ki(&self) -> f64 {
        self.pid.cfg().ki
    }

    pub fn kd(&self) -> f64 {
        self.pid.cfg().kd
    }

    pub fn set_kp(&mut self, kp: f64) {
        self.pid.set_kp(kp);
    }

    pub fn set_ki(&mut self, ki: f64) {
        self.pid.set_ki(ki);
    }

    pub fn set_kd(&mut self, kd: f64) {
        self.pid.set_kd(kd);
    }

    pub fn auto_mode(&self) -> bool {
        self.cfg.auto_mode
    }

    pub fn set_auto_mode(&mut self, on: bool) {
        self.cfg.auto_mode = on;
        self.state = match (self.state, on) {
            (LoopState::Active, false) => LoopState::Manual,
            (LoopState::Manual, true) => LoopState::Active,
            (state, _) => state,
        };
        info!("auto mode {}", if on { "on" } else { "off" });
    }

    pub fn handle(&mut self, request: ControlRequest) -> ControlReply {
        match request {
            ControlRequest::SetTarget(v) => {
                self.set_target(v);
                ControlReply::Ok
            }
            ControlRequest::GetTarget => ControlReply::Value(self.target()),
            ControlRequest::SetKp(v) => {
                self.set_kp(v);
                ControlReply::Ok
            }
            ControlRequest::SetKi(v) => {
                self.set_ki(v);
                ControlReply::Ok
            }
            ControlRequest::SetKd(v) => {
                self.set_kd(v);
                ControlReply::Ok
            }
            ControlRequest::GetKp => ControlReply::Value(self.kp()),
            ControlRequest::GetKi => ControlReply::Value(self.ki()),
            ControlRequest::GetKd => ControlReply::Value(self.kd()),
            ControlRequest::SetAutoMode(on) => {
                self.set_auto_mode(on);
                ControlReply::Flag(self.auto_mode())
            }
            ControlRequest::Get(key) => ControlReply::Value(match key {
                TelemetryKey::PTerm => self.last_terms.p,
                TelemetryKey::ITerm => self.last_terms.i,
                TelemetryKey::DTerm => self.last_terms.d,
                TelemetryKey::ChangeToCurrent => self.last_delta,
                TelemetryKey::OldU => self.old_u,
                TelemetryKey::Integral => self.pid.integral(),
            }),
        }
    }

    /// Enable the status channel, apply actuator pre-conditions, and seed
    /// the baseline from the actuator's current value.
    pub fn activate(&mut self) -> Result<(), LoopError> {
        if self.state != LoopState::Init {
            return Err(LoopError::BadState(self.state));
        }
        self.io
            .set(&self.cfg.status_channel, 1.0)
            .map_err(LoopError::Activation)?;
        for (channel, value) in &self.cfg.preconditions {
            self.io.set(channel, *value).map_err(LoopError::Activation)?;
        }
        let status = self
            .io
            .get(&self.cfg.status_channel)
            .map_err(LoopError::Activation)?;
        if !status.enabled(&self.cfg.payload_field) {
            return Err(LoopError::NotEnabled(self.cfg.status_channel.clone()));
        }
        let check = self
            .io
            .get(&self.cfg.check_channel)
            .map_err(LoopError::Activation)?;
        let u = check
            .num(&self.cfg.payload_field)
            .map_err(LoopError::Activation)?;
        let (lo, hi) = (self.pid.cfg().u_min, self.pid.cfg().u_max);
        if !(lo..=hi).contains(&u) {
            warn!("actuator reports {u:.3} outside [{lo:.3}, {hi:.3}]; clamping baseline");
        }
        self.old_u = u.clamp(lo, hi);
        self.state = LoopState::Ready;
        info!("loop ready, baseline {:.3}", self.old_u);
        Ok(())
    }

    /// One deadline-bounded read of the input channel (pull mode).
    pub fn poll_input(&self) -> Result<Reading, BusError> {
        self.io.get(&self.cfg.input_channel)
    }

    /// Push-mode entry: extract, convert, timestamp, then process.
    pub fn ingest(&mut self, reading: &Reading) {
        if matches!(self.state, LoopState::Init | LoopState::Stopped) {
            debug!("sample ignored in {:?}", self.state);
            return;
        }
        let raw = match reading.num(&self.cfg.payload_field) {
            Ok(v) if v.is_finite() => v,
            Ok(v) => {
                self.dropped_samples += 1;
                debug!("non-finite sample {v} dropped");
                return;
            }
            Err(err) => {
                self.dropped_samples += 1;
                debug!("sample dropped: {err}");
                return;
            }
        };
        let pv = match self.cfg.conversion {
            Some(cal) => match cal.temperature_k(raw) {
                Some(t) => t,
                None => {
                    self.dropped_samples += 1;
                    warn!("resistance {raw:.3} ohm is not convertible; sample dropped");
                    return;
                }
            },
            None => raw,
        };
        let t = self.sample_time(reading);
        self.process(pv, t);
    }

    fn sample_time(&self, reading: &Reading) -> DateTime<Utc> {
        match reading.text(TIMESTAMP_FIELD) {
            Some(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(t) => t.with_timezone(&Utc),
                Err(_) => {
                    debug!("unparseable timestamp {s:?}, using wall clock");
                    Utc::now()
                }
            },
            None => {
                debug!("sample carries no timestamp, using wall clock");
                Utc::now()
            }
        }
    }

    /// Process one timestamped sample end-to-end.
    pub fn process(&mut self, pv: f64, t: DateTime<Utc>) {
        if matches!(self.state, LoopState::Init | LoopState::Stopped) {
            return;
        }
        if self.first_run {
            self.first_run = false;
            // Seed the setpoint when the plant starts far from nominal;
            // otherwise the first minutes are one long setpoint step.
            if (self.setpoint - pv).abs() > 1.0 {
                info!(
                    "first sample {pv:.3} is far from setpoint {:.3}; seeding setpoint",
                    self.setpoint
                );
                self.setpoint = pv;
            }
        }
        let (prev_pv, prev_t) = match self.last_sample {
            Some(pair) => pair,
            None => {
                // A derivative needs two samples.
                self.last_sample = Some((pv, t));
                self.mark_running();
                self.trace.push(trace::Row {
                    time: t,
                    pv,
                    sp: self.setpoint,
                    u: self.old_u,
                });
                return;
            }
        };

        let mut dt = (t - prev_t).num_milliseconds() as f64 / 1e3;
        if dt <= 0.0 {
            // Clock anomalies must never propagate.
            dt = self.cfg.minimum_elapsed_time.max(1e-6);
        } else if dt < self.cfg.minimum_elapsed_time && !self.force_reprocess {
            debug!("sample {dt:.3}s after the last one; gated");
            return;
        }
        self.force_reprocess = false;
        self.mark_running();

        let out = self.pid.step(StepInput {
            sp: self.setpoint,
            pv,
            prev_pv,
            dt,
            old_u: self.old_u,
        });
        self.last_terms = out.terms;
        self.last_delta = out.delta;

        if let Command::Write(u) = out.command {
            self.write_and_verify(u);
        }

        self.last_sample = Some((pv, if t > prev_t { t } else { prev_t }));
        self.trace.push(trace::Row {
            time: t,
            pv,
            sp: self.setpoint,
            u: self.old_u,
        });
        self.publish_telemetry();
    }

    fn mark_running(&mut self) {
        if self.state == LoopState::Ready {
            self.state = if self.cfg.auto_mode {
                LoopState::Active
            } else {
                LoopState::Manual
            };
        }
    }

    fn write_and_verify(&mut self, u: f64) {
        if !self.cfg.auto_mode {
            debug!("auto mode off; write of {u:.3} suppressed");
            return;
        }
        match self.io.get(&self.cfg.status_channel) {
            Ok(status) if status.enabled(&self.cfg.payload_field) => {}
            Ok(_) => {
                warn!(
                    "status channel {} not enabled; write suppressed",
                    self.cfg.status_channel
                );
                return;
            }
            Err(err) => {
                warn!("status check failed ({err}); write suppressed");
                return;
            }
        }
        if let Err(err) = self.io.set(&self.cfg.output_channel, u) {
            warn!("write of {u:.3} to {} failed: {err}", self.cfg.output_channel);
            return;
        }
        // The baseline tracks the command, not the readback: the actuator
        // may still be slewing and waiting would stall the control path.
        self.old_u = u;

        let deadline = Instant::now() + self.cfg.max_settle_wait;
        loop {
            let read = self
                .io
                .get(&self.cfg.check_channel)
                .and_then(|r| r.num(&self.cfg.payload_field));
            if let Ok(value) = read {
                if (value - u).abs() <= self.cfg.tolerance {
                    return;
                }
            }
            if Instant::now() >= deadline {
                let enabled = self
                    .io
                    .get(&self.cfg.status_channel)
                    .map(|r| r.enabled(&self.cfg.payload_field))
                    .unwrap_or(false);
                warn!(
                    "{} did not reach {u:.3} within {:?} (status enabled: {enabled})",
                    self.cfg.check_channel, self.cfg.max_settle_wait
                );
                return;
            }
            thread::sleep(self.cfg.settle_poll);
        }
    }

    fn publish_telemetry(&mut self) {
        let Some(telemetry) = self.telemetry.as_ref() else {
            return;
        };
        let auto = if self.cfg.auto_mode { 1.0 } else { 0.0 };
        for (name, value) in [
            ("p_term", self.last_terms.p),
            ("i_term", self.last_terms.i),
            ("d_term", self.last_terms.d),
            ("change_to_current", self.last_delta),
            ("auto_mode", auto),
        ] {
            if let Err(err) = telemetry.publish(name, value) {
                debug!("telemetry {name} not published: {err}");
            }
        }
    }

    /// Final flush; further samples are ignored.
    pub fn stop(&mut self) {
        self.state = LoopState::Stopped;
        self.trace.flush();
        info!("loop stopped after {} trace rows", self.trace.rows_total());
    }
}
