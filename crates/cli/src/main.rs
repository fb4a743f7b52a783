use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bus::Transport;
use clap::{Parser, ValueEnum};
use controller::{FeedForwardPolicy, PidConfig};
use log::warn;
use pidloop::{BusTelemetry, LoopConfig, PidLoop};
use sim::{PlantParams, Rig, Sensor, SensorFault};

#[derive(Clone, Debug, ValueEnum)]
enum Scenario {
    /// Hold the plant at the setpoint.
    Lock,
    /// Setpoint step with the feed-forward band and ramp limit engaged.
    Step,
    /// Gains that drive the heater into its bound.
    Saturation,
    /// Biased sensor partway through the run.
    SensorFault,
    /// Heater readback disagrees with the command partway through.
    VerifyFail,
}

#[derive(Parser, Debug)]
#[command(
    name = "cryo-heater-loop",
    version,
    about = "Closed-loop heater control against a simulated cryostat"
)]
struct Args {
    #[arg(value_enum, long, default_value = "lock")]
    scenario: Scenario,

    /// Total simulated time in seconds
    #[arg(long, default_value_t = 600.0)]
    seconds: f64,

    /// Fixed sample period in milliseconds
    #[arg(long, default_value_t = 1000)]
    dt_ms: u64,

    /// Temperature setpoint (K)
    #[arg(long, default_value_t = 150.0)]
    setpoint: f64,

    #[arg(long, default_value_t = 0.5)]
    kp: f64,

    #[arg(long, default_value_t = 0.02)]
    ki: f64,

    #[arg(long, default_value_t = 0.0)]
    kd: f64,

    /// RNG seed for deterministic runs
    #[arg(long, default_value_t = 12345)]
    seed: u64,

    /// Directory for the CSV trace; omitted disables persistence
    #[arg(long)]
    trace_dir: Option<PathBuf>,
}

#[derive(serde::Serialize)]
struct TraceRow {
    t_s: f64,
    temp_k: f64,
    setpoint_k: f64,
    heater_a: f64,
    p_term: f64,
    i_term: f64,
    d_term: f64,
    state: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let dt_s = (args.dt_ms as f64) / 1000.0;
    let steps = (args.seconds / dt_s).ceil() as u64;

    let params = PlantParams::default();
    let mut sensor = Sensor::new(args.seed);
    sensor.noise_std = 0.02;
    let rig = Arc::new(Rig::new(params, sensor));
    apply_scenario(&args.scenario, &rig);

    let pid_cfg = PidConfig {
        kp: args.kp,
        ki: args.ki,
        kd: args.kd,
        feed_forward: Some(FeedForwardPolicy::default()),
        ..Default::default()
    };
    let loop_cfg = LoopConfig {
        setpoint: args.setpoint,
        minimum_elapsed_time: dt_s * 0.5,
        max_settle_wait: Duration::from_millis(50),
        settle_poll: Duration::from_millis(10),
        preconditions: vec![("heater_voltage_limit".to_string(), 12.0)],
        trace_dir: args.trace_dir.clone(),
        ..Default::default()
    };
    let curve = sim::steady_state_curve(&params, params.ambient_k + 3.0, 400.0)?;

    let transport: Arc<dyn Transport> = rig.clone();
    let mut pid_loop =
        PidLoop::with_feed_forward(loop_cfg, pid_cfg, transport.clone(), Box::new(curve))?;
    pid_loop.set_telemetry(Box::new(BusTelemetry::new(
        transport,
        Duration::from_millis(100),
        "pidloop",
    )));
    pid_loop.activate()?;

    // One JSONL row per sample, like a live telemetry tap.
    for k in 0..steps {
        let t_s = (k as f64) * dt_s;
        rig.step(dt_s);

        mid_run_tweaks(&args.scenario, &rig, t_s, args.seconds);

        match pid_loop.poll_input() {
            Ok(reading) => pid_loop.ingest(&reading),
            Err(err) => warn!("sensor read failed: {err}"),
        }

        let terms = pid_loop.terms();
        let row = TraceRow {
            t_s,
            temp_k: rig.temp_k(),
            setpoint_k: pid_loop.target(),
            heater_a: rig.heater_a(),
            p_term: terms.p,
            i_term: terms.i,
            d_term: terms.d,
            state: format!("{:?}", pid_loop.state()),
        };
        println!("{}", serde_json::to_string(&row)?);
    }

    pid_loop.stop();
    Ok(())
}

fn apply_scenario(s: &Scenario, rig: &Rig) {
    match s {
        Scenario::Lock => {
            // Start close to the setpoint so the loop locks rather than seeds.
            rig.set_temp(149.0);
        }
        Scenario::Step => {
            rig.set_temp(130.0);
            rig.set_heater(1.0);
        }
        Scenario::Saturation => {
            rig.set_temp(80.0);
        }
        Scenario::SensorFault => {
            rig.set_temp(149.0);
        }
        Scenario::VerifyFail => {
            rig.set_temp(149.0);
        }
    }
}

fn mid_run_tweaks(s: &Scenario, rig: &Rig, t_s: f64, total_s: f64) {
    if t_s <= total_s * 0.3 {
        return;
    }
    match s {
        Scenario::SensorFault => rig.set_fault(SensorFault::Bias { value: 2.0 }),
        Scenario::VerifyFail => rig.set_readback_scale(10.0),
        _ => {}
    }
}
