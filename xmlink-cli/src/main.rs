//! xmlink — entry point.
//!
//! ```text
//! xmlink exec get-version                   Run one command, print the response
//! xmlink exec run --scope Project --param steps=10 --no-wait
//! xmlink watch --subscribe build-events     Print events until Ctrl-C
//! xmlink --listen 0.0.0.0:50000 watch       Wait for the peer to dial in
//! xmlink --config <path>                    Load a custom config TOML
//! xmlink --gen-config                       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xmlink_cli::config::AppConfig;
use xmlink_cli::session::{Action, Session, parse_param};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "xmlink", about = "Drive an automation peer over the xmlink protocol")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "xmlink.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Dial this `host:port` (overrides the config file).
    #[arg(long, conflicts_with = "listen")]
    connect: Option<String>,

    /// Accept one connection on this `host:port` instead of dialing.
    #[arg(long)]
    listen: Option<String>,

    #[command(subcommand)]
    action: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one command.
    Exec {
        /// Command name.
        name: String,
        /// Scope the command applies to.
        #[arg(long)]
        scope: Option<String>,
        /// Command parameter, repeatable.
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Send without waiting for the response.
        #[arg(long)]
        no_wait: bool,
    },
    /// Print incoming messages until the peer closes or Ctrl-C.
    Watch {
        /// Event stream to subscribe to, repeatable.
        #[arg(long)]
        subscribe: Vec<String>,
    },
}

impl From<Command> for Action {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Exec {
                name,
                scope,
                params,
                no_wait,
            } => Action::Exec {
                name,
                scope,
                params,
                wait: !no_wait,
            },
            Command::Watch { subscribe } => Action::Watch { subscribe },
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&AppConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let Some(action) = cli.action else {
        eprintln!("nothing to do: give a subcommand (exec, watch) or --gen-config");
        std::process::exit(2);
    };

    // Read config; its diagnostics wait until tracing is up.
    let loaded = AppConfig::read(&cli.config);
    let mut config = loaded.as_ref().ok().cloned().flatten().unwrap_or_default();
    if let Some(addr) = cli.connect {
        config.network.connect = addr;
        config.network.listen = None;
    }
    if let Some(addr) = cli.listen {
        config.network.listen = Some(addr);
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match loaded {
        Ok(Some(_)) => info!("config loaded from {}", cli.config.display()),
        Ok(None) => info!("no config at {}; using defaults", cli.config.display()),
        Err(e) => warn!("invalid config {}: {e}; using defaults", cli.config.display()),
    }
    config.session.validate()?;

    info!("xmlink v{}", env!("CARGO_PKG_VERSION"));
    match &config.network.listen {
        Some(addr) => info!("waiting for peer on {addr}"),
        None => info!("peer: {}", config.network.connect),
    }

    Session::new(config).run(&Action::from(action)).await?;

    Ok(())
}
