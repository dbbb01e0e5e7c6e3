//! Hot-plug Harness
//!
//! Runs hot-plug scenarios against an SPDK target, an IPU and a host, and
//! the pod stress scenario against a Kubernetes cluster.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hotplug_harness::domain::ports::PodApiRef;
use hotplug_harness::pods::load_pod_descriptor;
use hotplug_harness::{
    Error, ExecutionEnvironment, HarnessConfig, HotPlugRunner, HotPlugScenario, InMemoryPodApi,
    KubePodApi, PlatformFactory, PodLifecycle, PodStressScenario, Result, ScenarioReport,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Hot-plug Harness - NVMe-oF / virtio-blk hot-plug and pod stress validation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Harness configuration file (YAML)
    #[arg(long, env = "HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured execution environment
    #[arg(long, env = "HARNESS_ENVIRONMENT", value_enum)]
    environment: Option<ExecutionEnvironment>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run hot-plug scenarios
    Run {
        #[arg(value_enum, default_value = "all")]
        scenario: ScenarioSelection,
    },

    /// Repeatedly delete and recreate a pod while checking connectivity
    PodStress {
        /// Rendered descriptors of the two pods
        #[arg(long, num_args = 2, required = true)]
        pods: Vec<PathBuf>,

        /// Delete/recreate cycles
        #[arg(long, env = "POD_STRESS_ITERATIONS")]
        iterations: Option<u32>,

        /// Namespace cleaned before the run
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ScenarioSelection {
    Baseline,
    AtCapacity,
    AboveCapacity,
    All,
}

impl ScenarioSelection {
    fn scenarios(self) -> Vec<HotPlugScenario> {
        match self {
            ScenarioSelection::Baseline => vec![HotPlugScenario::Baseline],
            ScenarioSelection::AtCapacity => vec![HotPlugScenario::AtCapacity],
            ScenarioSelection::AboveCapacity => vec![HotPlugScenario::AboveCapacity],
            ScenarioSelection::All => HotPlugScenario::ALL.to_vec(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = load_config(&args)?;

    info!("Starting Hot-plug Harness");
    info!("  Version: {}", hotplug_harness::VERSION);
    info!("  Environment: {}", config.environment);
    info!("  Capacity: min {} / max {}", config.min_ramdrive, config.max_ramdrive);

    let reports = match &args.command {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run { scenario } => {
            let platforms = PlatformFactory::create(&config)?;
            HotPlugRunner::new(config, platforms)
                .run_all(&scenario.scenarios())
                .await
        }
        Command::PodStress {
            pods,
            iterations,
            namespace,
        } => {
            let mut config = config;
            if let Some(iterations) = iterations {
                config.pod_stress.iterations = *iterations;
            }
            if let Some(namespace) = namespace {
                config.pod_stress.namespace = namespace.clone();
            }
            vec![run_pod_stress(&config, pods).await?]
        }
    };

    println!("{}", serde_json::to_string_pretty(&reports)?);

    let failed = reports.iter().filter(|r| !r.passed).count();
    info!("{} of {} scenarios passed", reports.len() - failed, reports.len());
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(environment) = args.environment {
        config.environment = environment;
    }
    config.validate()?;
    Ok(config)
}

async fn run_pod_stress(config: &HarnessConfig, pods: &[PathBuf]) -> Result<ScenarioReport> {
    let [a, b] = pods else {
        return Err(Error::Configuration(
            "pod stress needs exactly two pod descriptors".into(),
        ));
    };
    let pod_a = load_pod_descriptor(a)?;
    let pod_b = load_pod_descriptor(b)?;

    let api: PodApiRef = match config.environment {
        ExecutionEnvironment::Simulated => Arc::new(InMemoryPodApi::new()),
        _ => Arc::new(KubePodApi::try_default(config.command_timeout()).await?),
    };

    let lifecycle = PodLifecycle::new(api, config.poll.policy());
    Ok(PodStressScenario::new(lifecycle, config.pod_stress.clone(), config.environment)
        .run(&pod_a, &pod_b)
        .await)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "reqwest=warn", "rustls=warn"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?,
        );
    }

    // reports go to stdout, logs to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
