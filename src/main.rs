//! Command-line front end for memristor_daq.
//!
//! ```bash
//! memristor-daq sweep --start 0 --stop 1 --step 0.1 --delay 0.1 --compliance 1e-3
//! memristor-daq --config lab.toml sweep --hardware --resource GPIB0::24::INSTR
//! memristor-daq list --backend serial
//! memristor-daq self-test
//! ```
//!
//! Log verbosity follows `RUST_LOG`, falling back to `application.log_level`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use memristor_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use memristor_daq::discovery;
use memristor_daq::storage::CsvWriter;
use memristor_daq::sweep::{RawSweepInput, SweepEvent, SweepParameters, SweepStatus};
use memristor_daq::transport::{self, TransportBackend};
use memristor_daq::Session;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "memristor-daq",
    version,
    about = "Voltage-sweep I-V characterization on a source-measure unit"
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one voltage sweep and save the record as CSV
    Sweep(SweepArgs),
    /// List instruments reachable through a backend
    List {
        /// Backend to enumerate; defaults to the configured one
        #[arg(long, value_enum)]
        backend: Option<TransportBackend>,
        /// Show the simulated instrument instead of real hardware
        #[arg(long)]
        simulated: bool,
        /// Also open this resource and report its identity
        #[arg(long)]
        probe: Option<String>,
    },
    /// Run the instrument's built-in self-test
    SelfTest(ConnectionArgs),
}

#[derive(Args)]
struct ConnectionArgs {
    /// Instrument resource address (e.g. GPIB0::24::INSTR, /dev/ttyUSB0)
    #[arg(long)]
    resource: Option<String>,
    /// Use the simulated instrument
    #[arg(long, conflicts_with = "hardware")]
    simulate: bool,
    /// Use real hardware
    #[arg(long)]
    hardware: bool,
    #[arg(long, value_enum)]
    backend: Option<TransportBackend>,
}

impl ConnectionArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(resource) = &self.resource {
            settings.instrument.resource = resource.clone();
        }
        if self.simulate {
            settings.instrument.simulate = true;
        }
        if self.hardware {
            settings.instrument.simulate = false;
        }
        if let Some(backend) = self.backend {
            settings.instrument.backend = backend;
        }
    }
}

#[derive(Args)]
struct SweepArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
    /// Start voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    start: Option<String>,
    /// Stop voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    stop: Option<String>,
    /// Signed step between points (V)
    #[arg(long, allow_hyphen_values = true)]
    step: Option<String>,
    /// Settling delay before each reading (s)
    #[arg(long, allow_hyphen_values = true)]
    delay: Option<String>,
    /// Current compliance limit (A)
    #[arg(long, allow_hyphen_values = true)]
    compliance: Option<String>,
    /// Directory for the CSV record; defaults to `storage.output_dir`
    #[arg(long)]
    output: Option<PathBuf>,
    /// Do not write a CSV record
    #[arg(long)]
    no_save: bool,
    /// Print the finished record as JSON
    #[arg(long)]
    json: bool,
}

impl SweepArgs {
    /// Operator text for every field, falling back to the configured sweep.
    fn raw_input(&self, defaults: &SweepParameters) -> RawSweepInput {
        let pick = |arg: &Option<String>, fallback: f64| {
            arg.clone().unwrap_or_else(|| fallback.to_string())
        };
        RawSweepInput {
            start_voltage: pick(&self.start, defaults.start_voltage),
            stop_voltage: pick(&self.stop, defaults.stop_voltage),
            step_voltage: pick(&self.step, defaults.step_voltage),
            delay_seconds: pick(&self.delay, defaults.delay_seconds),
            current_compliance_amps: pick(&self.compliance, defaults.current_compliance_amps),
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    init_tracing(&settings.application.log_level);
    info!("{} starting", settings.application.name);

    match cli.command {
        Command::Sweep(args) => {
            args.connection.apply(&mut settings);
            run_sweep(settings, args).await
        }
        Command::List {
            backend,
            simulated,
            probe,
        } => {
            if let Some(backend) = backend {
                settings.instrument.backend = backend;
                settings.instrument.simulate = false;
            }
            if simulated {
                settings.instrument.simulate = true;
            }
            list(settings, probe).await
        }
        Command::SelfTest(connection) => {
            connection.apply(&mut settings);
            let report = Session::scoped(settings, |session| async move {
                Ok::<_, anyhow::Error>(session.self_test().await?)
            })
            .await?;
            println!("{}", report);
            Ok(())
        }
    }
}

async fn run_sweep(settings: Settings, args: SweepArgs) -> Result<()> {
    let parameters = SweepParameters::parse(&args.raw_input(&settings.sweep))?;
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| settings.storage.output_dir.clone());

    let result = Session::scoped(settings, |session| async move {
        let mut events = session.engine().subscribe();
        let handle = session.start_sweep(parameters)?;

        let abort = handle.abort_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, aborting sweep");
                abort.abort();
            }
        });

        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SweepEvent::Phase(phase) => info!("Phase: {}", phase),
                    SweepEvent::Sample(p) => println!(
                        "[{:>4}/{}] {:+.4} V  {:+.6e} A",
                        p.index + 1,
                        p.total,
                        p.voltage,
                        p.current
                    ),
                    SweepEvent::Finished { .. } => break,
                }
            }
        });

        let result = handle.wait().await?;
        if let Err(e) = printer.await {
            warn!("Progress printer stopped: {}", e);
        }
        Ok::<_, anyhow::Error>(result)
    })
    .await?;

    println!("{}", result.summary());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if !args.no_save && !result.is_empty() {
        let path = CsvWriter::new(output_dir).save(&result)?;
        println!("Saved to {}", path.display());
    }

    match result.status() {
        SweepStatus::Failed => match result.error() {
            Some(e) => bail!("Sweep failed: {}", e),
            None => bail!("Sweep failed"),
        },
        _ => Ok(()),
    }
}

async fn list(settings: Settings, probe: Option<String>) -> Result<()> {
    let report = if settings.instrument.simulate {
        discovery::list_simulated()
    } else {
        discovery::list_resources(settings.instrument.backend).await
    };

    let label = report
        .backend
        .map(|b| b.to_string())
        .unwrap_or_else(|| "simulated".to_string());
    println!("Resources ({}):", label);
    if report.resources.is_empty() {
        println!("  (none)");
    }
    for resource in &report.resources {
        println!("  {}", resource);
    }
    for line in &report.diagnostics {
        println!("  note: {}", line);
    }

    if let Some(resource) = probe {
        let transport = transport::from_config(&settings.instrument)?;
        let probe = discovery::probe(transport, &resource).await;
        println!("Probe {}:", probe.resource);
        if let Some(identity) = &probe.identity {
            println!("  identity: {}", identity);
        }
        for line in &probe.diagnostics {
            println!("  {}", line);
        }
    }
    Ok(())
}
