//! CLI entry point for sock_cond.
//!
//! Starts the devices, runs one conditioning block per requested animal and
//! tears everything down again:
//!
//! ```bash
//! sock_cond --config rig.toml --animal 3 --animal 4 --day train1
//! sock_cond --simulate --json
//! sock_cond --config rig.toml --print-config
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sock_cond::config::Settings;
use sock_cond::core::AnimalBlock;
use sock_cond::error::CondError;
use sock_cond::hardware::mock::SimulatedDevices;
use sock_cond::hardware::ftdi::DigitalPort;
use sock_cond::hardware::rig::{HardwareDevices, PortOpener};
use sock_cond::hardware::DeviceFactory;
use sock_cond::messages::SessionEvent;
use sock_cond::recording::raw::RawVideoFactory;
use sock_cond::session::SessionHandle;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "sock_cond")]
#[command(about = "Odor/shock conditioning experiment controller", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force simulated devices
    #[arg(long, conflicts_with = "hardware")]
    simulate: bool,

    /// Force hardware devices
    #[arg(long)]
    hardware: bool,

    /// Animal to run; repeat for several blocks. Defaults to every configured animal.
    #[arg(long = "animal")]
    animals: Vec<String>,

    /// Day label selecting the protocol class
    #[arg(long)]
    day: Option<String>,

    #[arg(long)]
    group: Option<String>,

    #[arg(long)]
    cycle: Option<u32>,

    /// Print session events as JSON lines
    #[arg(long)]
    json: bool,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.simulate {
        settings.application.simulate = true;
    }
    if cli.hardware {
        settings.application.simulate = false;
    }
    if cli.print_config {
        print!("{}", toml::to_string_pretty(&settings).context("rendering configuration")?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    info!(
        "{} starting ({} devices)",
        settings.application.name,
        if settings.application.simulate { "simulated" } else { "hardware" }
    );

    let blocks = blocks_to_run(&cli, &settings);
    let factory: Arc<dyn DeviceFactory> = if settings.application.simulate {
        Arc::new(SimulatedDevices)
    } else {
        Arc::new(HardwareDevices::new(serial_ports()))
    };

    let (session, task) = SessionHandle::spawn(settings, factory, Arc::new(RawVideoFactory));
    let printer = tokio::spawn(print_events(session.subscribe(), cli.json));

    let result = run_blocks(&session, blocks).await;
    if let Err(e) = &result {
        error!("experiment aborted: {}", e);
    }

    if let Err(e) = session.stop().await {
        warn!("teardown reported errors: {}", e);
        if let CondError::ShutdownFailed(errors) = &e {
            for err in errors {
                warn!("  {}", err);
            }
        }
    }
    session.shutdown().await?;
    drop(session);
    task.await?;
    printer.abort();

    result.map_err(Into::into)
}

fn blocks_to_run(cli: &Cli, settings: &Settings) -> Vec<AnimalBlock> {
    let animals: Vec<String> = if cli.animals.is_empty() {
        settings.animal.animal_cls.keys().cloned().collect()
    } else {
        cli.animals.clone()
    };
    let day = cli
        .day
        .clone()
        .or_else(|| settings.animal.days.first().cloned())
        .unwrap_or_default();
    let group = cli
        .group
        .clone()
        .or_else(|| settings.animal.groups.first().cloned())
        .unwrap_or_default();
    let cycle = cli.cycle.or_else(|| settings.animal.cycles.first().copied()).unwrap_or(0);

    animals
        .into_iter()
        .map(|animal| {
            AnimalBlock::new(animal)
                .with_day(day.clone())
                .with_group(group.clone())
                .with_cycle(cycle)
        })
        .collect()
}

async fn run_blocks(session: &SessionHandle, blocks: Vec<AnimalBlock>) -> Result<(), CondError> {
    session.start_and_wait().await?;
    for block in blocks {
        let animal = block.animal_id.clone();
        let trials = session.run_block(block).await?;
        info!("animal {}: {} trials logged", animal, trials.len());
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("could not serialize event: {}", e),
            },
            Ok(SessionEvent::TrialLabel(label)) => println!("{}", label),
            Ok(SessionEvent::TrialCompleted(log)) => println!(
                "  trial {} at {:.3}s: odor={} shock={}",
                log.trial, log.event_time, log.odor, log.shock
            ),
            Ok(SessionEvent::BlockStarted {
                animal_id,
                class,
                num_trials,
            }) => println!("Animal {} ({}): {} trials", animal_id, class, num_trials),
            Ok(SessionEvent::Error(message)) => eprintln!("error: {}", message),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn serial_ports() -> PortOpener {
    use sock_cond::hardware::serial::SerialDigitalPort;
    Arc::new(|name: &str, baud: u32| -> Result<Box<dyn DigitalPort>> {
        Ok(Box::new(SerialDigitalPort::new(name, baud)))
    })
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_ports() -> PortOpener {
    Arc::new(|_name: &str, _baud: u32| -> Result<Box<dyn DigitalPort>> {
        Err(CondError::FeatureNotEnabled("instrument_serial".to_string()).into())
    })
}
