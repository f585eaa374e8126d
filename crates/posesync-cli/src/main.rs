use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use posesync_config::SessionConfig;
use posesync_core::{ConnectionPoint, ConnectionSpec, MetricsSnapshot, Session};
use posesync_spatial::{difference, FramedPose, Pose, Vector3D};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "posesync")]
#[command(about = "Spatial precision tracking and multi-user sync harness")]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate a configuration, then print the effective values as TOML
    CheckConfig {
        /// Config file (defaults to the per-user config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the two-object alignment scenario on a synthetic clock
    Simulate {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Ticks to run after the displacement
        #[arg(long, default_value_t = 30)]
        ticks: u32,

        /// How far the held object is moved, in millimeters
        #[arg(long, default_value_t = 5.0)]
        offset_mm: f64,

        /// Print the final metrics as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::CheckConfig { config } => check_config(config),
        Commands::Simulate {
            config,
            ticks,
            offset_mm,
            json,
        } => simulate(config, ticks, offset_mm, json),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SessionConfig> {
    let config = SessionConfig::load_or_default(path.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;
    info!("Configuration is valid");
    print!("{}", rendered);
    Ok(())
}

fn simulate(path: Option<PathBuf>, ticks: u32, offset_mm: f64, json: bool) -> Result<()> {
    if !offset_mm.is_finite() {
        bail!("offset must be a finite number of millimeters");
    }
    let config = load_config(path)?;
    let period = Duration::from_std(config.tick.period()).context("Tick period out of range")?;
    let start = Utc::now();
    let clock = |tick: u32| -> DateTime<Utc> { start + period * tick as i32 };

    let mut session = Session::new(config).context("Failed to start session")?;
    let now = clock(0);
    session.register_object("A", Pose::IDENTITY, 0.5, now)?;
    session.register_object("B", Pose::IDENTITY, 0.5, now)?;
    let spec = ConnectionSpec::new(
        "A-B",
        ConnectionPoint::new("A", "peg", Pose::IDENTITY),
        ConnectionPoint::new("B", "hole", Pose::IDENTITY),
        &session.config().precision,
    );
    session.register_connection(spec)?;
    session.join("p1", now);
    session.update_correspondence("p1", &Pose::IDENTITY, &Pose::IDENTITY, 1.0, now)?;
    session.acquire_ownership("p1", "B", now)?;
    session.tick(now);

    let moved = Pose::from_position(Vector3D::new(offset_mm / 1000.0, 0.0, 0.0));
    session.submit_update("p1", "B", FramedPose::shared(moved), 1, now)?;
    info!("p1 moved B by {} mm", offset_mm);

    for tick in 1..=ticks {
        let now = clock(tick);
        session.heartbeat("p1", now);
        let report = session.tick(now);
        for state in &report.states {
            info!(
                "tick {:>3} {} {:?} error {:.6} m precision {:.6}",
                report.tick, state.connection_id, state.status, state.position_error_m, state.precision
            );
        }
        for applied in &report.corrections {
            debug!(
                "correction {} on {}: {:.6} m, {:.4} deg ({:?})",
                applied.op.id,
                applied.op.object_id,
                applied.op.magnitude_m,
                applied.op.magnitude_deg,
                applied.outcome
            );
        }
    }

    let world = session.snapshot();
    let residual = match (world.get("A"), world.get("B")) {
        (Some(a), Some(b)) => difference(&a.pose, &b.pose).position_error_m,
        _ => bail!("simulation objects disappeared"),
    };
    info!("Residual error {:.9} m", residual);

    let metrics = session.metrics();
    if json {
        println!("{}", serde_json::to_string_pretty(metrics)?);
    } else {
        print_summary(metrics, residual);
    }
    Ok(())
}

fn print_summary(metrics: &MetricsSnapshot, residual_m: f64) {
    println!("ticks:                 {}", metrics.tick);
    println!("mode:                  {:?}", metrics.mode);
    println!("residual error:        {:.9} m", residual_m);
    println!("corrections applied:   {}", metrics.corrections_applied);
    println!("corrections superseded:{}", metrics.corrections_superseded);
    println!("correction frequency:  {:.2} Hz", metrics.correction_frequency_hz);
    println!(
        "connections:           {} satisfied, {} degraded, {} violated, {} inert",
        metrics.satisfied, metrics.degraded, metrics.violated, metrics.inert
    );
    println!("violation events:      {}", metrics.violation_events);
    for (participant, rate) in &metrics.drift_rates {
        println!("drift {:<16} {:.6} m/s", participant, rate);
    }
}
