mod body;
mod config;
mod paths;

use std::path::PathBuf;

use arbiter::title::set_process_title;
use arbiter::{CommandLauncher, ConfigurationFactory, Master, ParentWatchdog, SignalRouter, SingleProcessMonitor};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use body::StatBody;
use config::ConfigLoader;

#[derive(Debug, Parser)]
#[command(name = "harvester", version, about = "Log harvester daemon")]
struct Cli {
	/// Log at debug level unless RUST_LOG says otherwise
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Supervise one worker process per consumer group
	Run {
		#[arg(long)]
		config: Option<PathBuf>,
		/// Monitor every group in this process instead of spawning workers
		#[arg(short, long)]
		foreground: bool,
		/// Extra files to watch on top of the configured ones
		paths: Vec<PathBuf>,
	},
	/// Serve a single consumer group (spawned by `run`)
	#[command(hide = true)]
	Worker {
		#[arg(long)]
		group: String,
		#[arg(long)]
		config: Option<PathBuf>,
		paths: Vec<PathBuf>,
	},
	/// List the consumer groups the configuration yields
	Groups {
		#[arg(long)]
		config: Option<PathBuf>,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	let result = match cli.command {
		Command::Run {
			config,
			foreground: true,
			paths,
		} => cmd_foreground(loader(config), paths).await,
		Command::Run { config, paths, .. } => cmd_master(loader(config), paths, cli.verbose).await,
		Command::Worker { group, config, paths } => cmd_worker(loader(config), group, paths).await,
		Command::Groups { config } => cmd_groups(&loader(config)),
	};

	if let Err(e) = result {
		eprintln!("{} {}", "error:".red().bold(), e);
		std::process::exit(1);
	}
}

fn init_tracing(verbose: bool) {
	let default = if verbose { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}

fn loader(config: Option<PathBuf>) -> ConfigLoader {
	ConfigLoader::new(config.unwrap_or_else(paths::default_config_path))
}

async fn cmd_master(loader: ConfigLoader, paths: Vec<PathBuf>, verbose: bool) -> arbiter::Result<()> {
	let thresholds = loader.create()?.supervisor.thresholds()?;

	// Workers are fresh images of this binary, configured from the same file.
	let mut launcher = CommandLauncher::new(std::env::current_exe()?)
		.args(["worker", "--group", "{group}", "--config"])
		.arg(loader.path().to_string_lossy());
	if verbose {
		launcher = launcher.arg("--verbose");
	}
	let launcher = launcher
		.arg("--")
		.args(paths.iter().map(|p| p.to_string_lossy().into_owned()));

	set_process_title("hv: master");
	let router = SignalRouter::new(thresholds.max_signal_queue)?;
	let _forwarders = router.install()?;

	tracing::info!(config = %loader.path().display(), "starting master");
	let mut master = Master::new(loader, launcher, router, thresholds);
	master.run().await
}

async fn cmd_worker(loader: ConfigLoader, group: String, paths: Vec<PathBuf>) -> arbiter::Result<()> {
	let settings = loader.create()?.supervisor;
	let thresholds = settings.thresholds()?;
	let watchdog = ParentWatchdog::new(settings.watchdog_interval()?);

	set_process_title(&format!("hv: {}", group));
	let router = SignalRouter::new(thresholds.max_signal_queue)?;
	let _forwarders = router.install()?;

	tracing::info!(%group, parent = %watchdog.original_parent(), "starting worker");
	let mut monitor = SingleProcessMonitor::for_group(loader, group, StatBody::default(), paths, router)
		.watchdog(watchdog);
	monitor.run().await
}

async fn cmd_foreground(loader: ConfigLoader, paths: Vec<PathBuf>) -> arbiter::Result<()> {
	let thresholds = loader.create()?.supervisor.thresholds()?;
	let router = SignalRouter::new(thresholds.max_signal_queue)?;
	let _forwarders = router.install()?;

	tracing::info!(config = %loader.path().display(), "monitoring in the foreground");
	let mut monitor = SingleProcessMonitor::new(loader, StatBody::default(), paths, router);
	monitor.run().await
}

fn cmd_groups(loader: &ConfigLoader) -> arbiter::Result<()> {
	let config = loader.create()?;
	let groups = config.consumers_by_group();
	if groups.is_empty() {
		eprintln!("no consumers configured in {}", loader.path().display());
		return Ok(());
	}

	for (group, consumers) in &groups {
		println!("{}", group.bold());
		for name in consumers {
			let paths: Vec<String> = config.consumers[*name]
				.paths
				.iter()
				.map(|p| p.display().to_string())
				.collect();
			println!("  {} {}", name.cyan(), paths.join(", ").dimmed());
		}
	}
	Ok(())
}
