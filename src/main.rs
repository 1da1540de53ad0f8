mod builder;
mod config;
mod connection;
mod instance;
mod session;
mod signals;

use builder::Builder;
use clap::Parser;
use config::SupervisorConfig;
use instance::{Instance, InstanceError};
use signals::SignalHandler;
use std::path::PathBuf;
use std::sync::Arc;

/// Run an external builder's `run` program under supervision: hand it the
/// peer connection, forward its stderr to the log, stop it gracefully on
/// SIGINT/SIGTERM, and exit with its exit code.
#[derive(Parser, Debug)]
#[command(name = "runwarden", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "runwarden.toml")]
    config: PathBuf,

    /// Package identifier (overrides config)
    #[arg(long)]
    package_id: Option<String>,

    /// Builder directory containing bin/run (overrides config)
    #[arg(long)]
    builder: Option<PathBuf>,

    /// Builder display name (overrides config)
    #[arg(long)]
    builder_name: Option<String>,

    /// Build output directory (overrides config)
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// Peer address handed to the run program (overrides config)
    #[arg(long)]
    peer_address: Option<String>,

    /// Seconds between SIGTERM and SIGKILL on shutdown (overrides config)
    #[arg(long)]
    grace_secs: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (signal delivery details)
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut SupervisorConfig) {
        if let Some(package_id) = &self.package_id {
            config.instance.package_id = package_id.clone();
        }
        if let Some(location) = &self.builder {
            config.builder.location = location.clone();
            if config.builder.name.is_empty() {
                config.builder.name = location
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
        }
        if let Some(name) = &self.builder_name {
            config.builder.name = name.clone();
        }
        if let Some(dir) = &self.build_dir {
            config.instance.build_output_dir = dir.clone();
        }
        if let Some(address) = &self.peer_address {
            config.peer.address = address.clone();
        }
        if let Some(secs) = self.grace_secs {
            config.instance.termination_grace_period_secs = secs;
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "runwarden=debug"
        } else if self.quiet {
            "runwarden=error"
        } else {
            "runwarden=info"
        }
    }
}

/// Map the outcome of a run to the supervisor's own exit code: the child's
/// code when it exited on its own, 128+N when it died from signal N, 1 for
/// anything else.
fn exit_code_for(result: &Result<i32, InstanceError>) -> i32 {
    match result {
        Ok(code) => *code,
        Err(InstanceError::SignalTerminated { signal, .. }) => 128 + *signal as i32,
        Err(e) if e.exit_code() > 0 => e.exit_code(),
        Err(_) => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");
    std::process::exit(run(&cli).await);
}

async fn run(cli: &Cli) -> i32 {
    let mut config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return 1;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "config validation failed");
        return 1;
    }

    if cli.dry_run {
        println!("runwarden v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Builder: {} ({})", config.builder.name, config.builder.location.display());
        println!("Run program: {}", Builder::from(&config.builder).run_program().display());
        println!("Package: {}", config.instance.package_id);
        println!("Build output: {}", config.instance.build_output_dir.display());
        println!("Peer address: {}", config.peer.address);
        println!("TLS: {}", config.peer.client_cert.is_some());
        println!(
            "Grace period: {}s",
            config.instance.termination_grace_period_secs
        );
        println!("Dry run mode: config validated, not running.");
        return 0;
    }

    let connection = match config.peer.load_connection() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load peer connection material");
            return 1;
        }
    };

    let mut signals = match SignalHandler::install() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return 1;
        }
    };

    let builder = Arc::new(Builder::from(&config.builder));
    let mut instance = Instance::new(
        config.instance.package_id.clone(),
        builder,
        config.instance.build_output_dir.clone(),
    )
    .with_termination_grace_period(config.instance.termination_grace_period());

    if let Err(e) = instance.start(&connection) {
        tracing::error!(error = %e, package_id = instance.package_id(), "failed to start instance");
        return 1;
    }
    tracing::info!(
        package_id = instance.package_id(),
        pid = instance.session().map(|s| s.pid()),
        "supervising builder run"
    );

    let result = tokio::select! {
        result = instance.wait() => result,
        signal = signals.recv() => {
            tracing::info!(?signal, "shutdown requested, stopping builder");
            if let Err(e) = instance.stop().await {
                tracing::error!(error = %e, "failed to stop builder");
            }
            instance.wait().await
        }
    };

    match &result {
        Ok(code) => tracing::info!(exit_code = code, "builder run completed"),
        Err(e) => tracing::error!(error = %e, "builder run failed"),
    }
    exit_code_for(&result)
}
