use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use arraysight::collector::PerfCollector;
use arraysight::config::Config;
use arraysight::rest::HttpClient;
use arraysight::template::Template;

/// Performance-counter collection engine for storage arrays.
#[derive(Parser)]
#[command(name = "arraysight", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("arraysight {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cluster = cfg.cluster.name.as_str(),
        "starting arraysight",
    );

    run(cfg)
}

/// One collector with its scheduling state.
struct Task {
    collector: PerfCollector<HttpClient>,
    last_counter: Instant,
    last_instance: Instant,
    standby_until: Option<Instant>,
}

fn run(cfg: Config) -> Result<()> {
    let mut tasks = Vec::with_capacity(cfg.templates.len());
    for path in &cfg.templates {
        let template = Template::load(path)?;
        let client = HttpClient::new(&cfg.cluster)?;
        let collector = PerfCollector::init(client, template, &cfg.cluster.name)
            .with_context(|| format!("initializing collector for {}", path.display()))?;

        info!(object = collector.object(), "collector initialized");
        tasks.push(Task {
            collector,
            last_counter: Instant::now(),
            last_instance: Instant::now(),
            standby_until: None,
        });
    }

    // Start-up: schema then instances, so the first data poll can address
    // metrics and instances by name.
    for task in &mut tasks {
        run_phase(task, Phase::Counter, cfg.schedule.standby);
        run_phase(task, Phase::Instance, cfg.schedule.standby);
    }

    loop {
        std::thread::sleep(cfg.schedule.data);

        for task in &mut tasks {
            if let Some(until) = task.standby_until {
                if Instant::now() < until {
                    continue;
                }
                task.standby_until = None;
                info!(object = task.collector.object(), "leaving stand-by");
            }

            if task.last_counter.elapsed() >= cfg.schedule.counter {
                task.last_counter = Instant::now();
                run_phase(task, Phase::Counter, cfg.schedule.standby);
            }
            if task.last_instance.elapsed() >= cfg.schedule.instance {
                task.last_instance = Instant::now();
                run_phase(task, Phase::Instance, cfg.schedule.standby);
            }

            run_phase(task, Phase::Data, cfg.schedule.standby);
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Counter,
    Instance,
    Data,
}

fn run_phase(task: &mut Task, phase: Phase, standby: Duration) {
    let object = task.collector.object().to_string();
    let result = match phase {
        Phase::Counter => task.collector.poll_counter(),
        Phase::Instance => task.collector.poll_instance(),
        Phase::Data => task.collector.poll_data(),
    };

    match result {
        Ok(Some(matrices)) => {
            // Exporters consume the emitted map; the reference binary logs
            // a cycle summary instead.
            let meta = task.collector.metadata().data;
            for (name, matrix) in &matrices {
                info!(
                    object = name.as_str(),
                    instances = matrix.instances().len(),
                    metrics = matrix.metrics().len(),
                    skips = meta.skips,
                    partials = meta.num_partials,
                    api_ms = meta.api_time.as_millis() as u64,
                    calc_ms = meta.calc_time.as_millis() as u64,
                    "collected"
                );
            }
        }
        Ok(None) => {}
        Err(e) if e.is_request_rejected() => {
            warn!(object = object.as_str(), error = %e, "request rejected, standing by");
            task.standby_until = Some(Instant::now() + standby);
        }
        Err(e) if e.is_retryable_empty() => {
            info!(object = object.as_str(), error = %e, "no instances this cycle");
        }
        Err(e) => {
            error!(object = object.as_str(), error = %e, "poll failed");
        }
    }
}
