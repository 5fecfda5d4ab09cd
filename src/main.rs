use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::watch;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use promcube::cube::CubeSet;
use promcube::discovery::{self, MetricInfo};
use promcube::scheduler::{unix_now, CubeScheduler};
use promcube::schema::SchemaReconciler;
use promcube::{metrics, ClickHouseStore, Config, CubeStore, MemoryStore, PrometheusClient};

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        // path.N-1 -> path.N, ..., path -> path.1
        for i in (1..self.max_files).rev() {
            let src = format!("{}.{}", self.path, i);
            let dst = format!("{}.{}", self.path, i + 1);
            let _ = std::fs::rename(&src, &dst);
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    // With PROMCUBE_LOG_FILE set, `log` records go to the rotated file through
    // env_logger; otherwise they are bridged into tracing.
    match std::env::var("PROMCUBE_LOG_FILE") {
        Ok(path) => {
            let mut builder =
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
            let max_size_mb: u64 = env_or("PROMCUBE_LOG_MAX_SIZE_MB", 10);
            let max_files: u32 = env_or("PROMCUBE_LOG_MAX_FILES", 3);
            if let Ok(rot) = RotatingFile::new(path, max_size_mb * 1024 * 1024, max_files) {
                builder.target(env_logger::Target::Pipe(Box::new(rot)));
            }
            let _ = builder.try_init();
        }
        Err(_) => {
            let _ = LogTracer::init();
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "promcube")]
#[command(about = "Keeps denormalized ClickHouse cubes in sync with Prometheus metrics")]
struct Cli {
    /// YAML file with prometheus, clickhouse and scheduler settings
    #[arg(long, global = true, env = "PROMCUBE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "PROMCUBE_PROMETHEUS_URL")]
    prometheus_url: Option<String>,

    /// Skip TLS certificate verification towards Prometheus
    #[arg(long, global = true)]
    insecure: bool,

    #[arg(long, global = true, env = "PROMCUBE_CLICKHOUSE_URL")]
    clickhouse_url: Option<String>,

    #[arg(long, global = true, env = "PROMCUBE_CLICKHOUSE_DATABASE")]
    clickhouse_database: Option<String>,

    #[arg(long, global = true, env = "PROMCUBE_CLICKHOUSE_USER")]
    clickhouse_user: Option<String>,

    #[arg(long, global = true, env = "PROMCUBE_CLICKHOUSE_PASSWORD", hide_env_values = true)]
    clickhouse_password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync the configured cubes into ClickHouse
    Run {
        /// Cube definitions file
        #[arg(short, long, env = "PROMCUBE_CUBES")]
        cubes: PathBuf,

        /// Use an in-memory store and print each cube table as CSV (implies --once)
        #[arg(long)]
        dry_run: bool,

        /// Process every cube once and exit
        #[arg(long)]
        once: bool,

        /// Rows per insert batch
        #[arg(long, env = "PROMCUBE_BATCH_SIZE")]
        batch_size: Option<usize>,
    },

    /// Draft new definitions from the metrics backend
    Generate {
        #[command(subcommand)]
        cmd: GenerateCmd,
    },

    /// Explore the metrics backend
    List {
        #[command(subcommand)]
        cmd: ListCmd,
    },

    /// Distinct values of a label on a metric
    Valuehelp {
        #[arg(short, long)]
        metric: String,
        #[arg(short, long)]
        dimension: String,
    },

    /// Remove persisted cube objects
    Delete {
        #[command(subcommand)]
        cmd: DeleteCmd,
    },
}

#[derive(Subcommand)]
enum GenerateCmd {
    /// Emit a cube definition joining the selected metrics on their shared labels
    Cube {
        #[arg(short, long)]
        name: String,
        /// Metric to include; repeat for several. Defaults to every metric.
        #[arg(short, long = "metric")]
        metrics: Vec<String>,
        /// Write the YAML here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ListCmd {
    /// Metrics with their label names
    Metrics {
        /// Only metrics carrying this label; repeat for several
        #[arg(long = "dimension-filter")]
        dimension_filter: Vec<String>,
    },
    /// Every distinct label name
    Dimensions,
}

#[derive(Subcommand)]
enum DeleteCmd {
    /// Drop the views, cube tables and query tables of every cube in the file
    Cube {
        #[arg(short, long)]
        cubes: PathBuf,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(url) = &cli.prometheus_url {
        config.prometheus.url = url.clone();
    }
    if cli.insecure {
        config.prometheus.insecure = true;
    }
    if let Some(url) = &cli.clickhouse_url {
        config.clickhouse.url = url.clone();
    }
    if let Some(db) = &cli.clickhouse_database {
        config.clickhouse.database = db.clone();
    }
    if cli.clickhouse_user.is_some() {
        config.clickhouse.user = cli.clickhouse_user.clone();
    }
    if cli.clickhouse_password.is_some() {
        config.clickhouse.password = cli.clickhouse_password.clone();
    }
    config.validate()?;
    Ok(config)
}

fn prometheus(config: &Config) -> Result<Arc<PrometheusClient>> {
    let client = PrometheusClient::new(
        config.prometheus.url.clone(),
        config.prometheus.step,
        config.prometheus.timeout,
        config.prometheus.insecure,
    )
    .context("creating Prometheus client")?;
    Ok(Arc::new(client))
}

async fn clickhouse(config: &Config) -> Result<ClickHouseStore> {
    let ch = &config.clickhouse;
    let store = ClickHouseStore::new(
        ch.url.clone(),
        ch.database.clone(),
        ch.user.clone(),
        ch.password.clone(),
    )?;
    store
        .ping()
        .await
        .with_context(|| format!("connecting to ClickHouse at {}", ch.url))?;
    Ok(store)
}

async fn run(config: Config, cubes: PathBuf, dry_run: bool, once: bool) -> Result<()> {
    let cube_set = CubeSet::load(&cubes)?;
    info!(
        "Loaded {} cubes from {}",
        cube_set.cubes.len(),
        cubes.display()
    );

    let source = prometheus(&config)?;
    let store: Arc<dyn CubeStore> = if dry_run {
        info!("Dry run: writing to an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(clickhouse(&config).await?)
    };

    let mut scheduler =
        CubeScheduler::new(cube_set.cubes, source, store, config.scheduler.clone())?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    if dry_run || once {
        let summary = scheduler.tick(unix_now(), &mut shutdown_rx).await?;
        if dry_run {
            let stdout = io::stdout();
            for report in &summary.reports {
                println!("# {}", report.cube.name);
                report.cube.write_csv(stdout.lock())?;
            }
        }
        if !summary.failed.is_empty() {
            anyhow::bail!("cube cycles failed: {}", summary.failed.join(", "));
        }
    } else {
        scheduler.run(shutdown_rx).await;
    }
    Ok(())
}

async fn delete_cubes(config: &Config, cubes: PathBuf) -> Result<()> {
    let cube_set = CubeSet::load(&cubes)?;
    let store = clickhouse(config).await?;
    let reconciler = SchemaReconciler::new(Arc::new(store), config.scheduler.call_timeout);
    for cube in &cube_set.cubes {
        reconciler.drop_cube(cube).await?;
    }
    Ok(())
}

fn print_metrics(metrics: &[MetricInfo]) {
    for m in metrics {
        println!("{}: {}", m.name, m.dimensions.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let result = match cli.command {
        Command::Run {
            cubes,
            dry_run,
            once,
            batch_size,
        } => {
            let mut config = config;
            if let Some(size) = batch_size {
                config.scheduler.batch_size = size;
                config.validate()?;
            }
            run(config, cubes, dry_run, once).await
        }
        Command::Generate {
            cmd:
                GenerateCmd::Cube {
                    name,
                    metrics,
                    output,
                },
        } => {
            let source = prometheus(&config)?;
            let found =
                discovery::discover_metrics(source.as_ref(), &metrics, &[], unix_now()).await?;
            for wanted in &metrics {
                if !found.iter().any(|m| &m.name == wanted) {
                    warn!("Metric '{wanted}' not found, skipping");
                }
            }
            let cube = discovery::generate_cube(&name, &found)?;
            let yaml = CubeSet { cubes: vec![cube] }.to_yaml()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, yaml)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("Cube '{name}' written to {}", path.display());
                }
                None => print!("{yaml}"),
            }
            Ok(())
        }
        Command::List { cmd } => {
            let source = prometheus(&config)?;
            match cmd {
                ListCmd::Metrics { dimension_filter } => {
                    let found =
                        discovery::discover_metrics(source.as_ref(), &[], &dimension_filter, unix_now())
                            .await?;
                    print_metrics(&found);
                }
                ListCmd::Dimensions => {
                    let found =
                        discovery::discover_metrics(source.as_ref(), &[], &[], unix_now()).await?;
                    for dim in discovery::all_dimensions(&found) {
                        println!("{dim}");
                    }
                }
            }
            Ok(())
        }
        Command::Valuehelp { metric, dimension } => {
            let source = prometheus(&config)?;
            for value in discovery::value_help(source.as_ref(), &metric, &dimension).await? {
                println!("{value}");
            }
            Ok(())
        }
        Command::Delete {
            cmd: DeleteCmd::Cube { cubes },
        } => delete_cubes(&config, cubes).await,
    };

    let counters = metrics::snapshot();
    info!(
        "Counters: rows_written={} batches_sent={} ambiguous_rows={} failed_cycles={}",
        counters.rows_written,
        counters.batches_sent,
        counters.ambiguous_rows,
        counters.failed_cycles
    );
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
