use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use mentor::config::{format_config, Config, ConfigError};
use mentor::daemon::{shutdown_signal, Daemon, DaemonError};
use mentor::identity::{Identity, IdentityError, SelfSigned};
use mentor::logging::{init_logging, LogConfig, Verbosity};
use mentor::share::ShareConfig;

#[derive(Parser)]
#[command(name = "mentor")]
#[command(version)]
#[command(about = "Share local files over HTTP and HTTPS, straight from this machine")]
#[command(
    long_about = "A peer-hosted file-sharing daemon. Serves configured files and directories over HTTP/HTTPS, maps a port on the home router through UPnP, and keeps serving the local network if the router will not cooperate."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/mentor/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write logs to this file (always at debug level)
    #[arg(long, global = true)]
    log_file: Option<String>,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve shares until interrupted
    Serve {
        /// Shares to publish: PATH (served as /<name>) or PUBLIC=PATH
        shares: Vec<String>,

        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Plain HTTP port (TLS clients are detected on it too)
        #[arg(short, long)]
        port: Option<u16>,

        /// Dedicated TLS port
        #[arg(long)]
        tls_port: Option<u16>,

        /// PEM certificate chain
        #[arg(long)]
        cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long)]
        key: Option<PathBuf>,

        /// Generate a self-signed certificate if none exists
        #[arg(long)]
        generate_cert: bool,

        /// Don't map a port on the router
        #[arg(long)]
        no_upnp: bool,

        /// Serve the status endpoint on this address, e.g. 127.0.0.1:9090
        #[arg(long)]
        status: Option<String>,

        /// Answer directory requests with 403 instead of a listing
        #[arg(long)]
        no_listing: bool,
    },
    /// Write a self-signed certificate and key
    GenCert {
        /// Where to write the certificate
        #[arg(long)]
        cert: PathBuf,

        /// Where to write the private key
        #[arg(long)]
        key: PathBuf,

        /// Host names for the certificate (default: localhost)
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_flags(cli.quiet, cli.verbose),
        log_file: cli.log_file.clone(),
        json: cli.log_json,
    });

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            shares,
            bind,
            port,
            tls_port,
            cert,
            key,
            generate_cert,
            no_upnp,
            status,
            no_listing,
        } => {
            let mut config = config;
            // CLI arguments take precedence over the config file
            config.bind = bind.or(config.bind);
            config.port = port.or(config.port);
            config.tls_port = tls_port.or(config.tls_port);
            config.cert = cert.or(config.cert);
            config.key = key.or(config.key);
            config.status = status.or(config.status);
            if generate_cert {
                config.generate_cert = Some(true);
            }
            if no_upnp {
                let mut upnp = config.upnp.take().unwrap_or_default();
                upnp.enabled = Some(false);
                config.upnp = Some(upnp);
            }
            if no_listing {
                config.allow_listing = Some(false);
            }
            config
                .shares
                .extend(shares.iter().map(|arg| ShareConfig::from_arg(arg)));

            serve(config).await
        }
        Commands::GenCert { cert, key, hosts } => {
            SelfSigned::generate(&hosts)
                .context("Failed to generate certificate")?
                .write(&cert, &key)
                .context("Failed to write certificate")?;
            let identity = Identity::load(&cert, &key)?;

            println!("Wrote {} and {}", cert.display(), key.display());
            println!("SHA-256 fingerprint: {}", identity.fingerprint());
            Ok(())
        }
        Commands::Config => {
            match &cli.config {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("Config file: {}", Config::config_path()?.display()),
            }
            println!();
            println!("{}", format_config(&config));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

async fn serve(config: Config) -> Result<()> {
    let settings = config.into_settings()?;
    let daemon = Daemon::new(settings)?;
    let handle = daemon.start().await?;

    println!("Serving on http://{}", handle.plain_addr());
    if let Some(addr) = handle.tls_addr() {
        println!("Serving on https://{}", addr);
    }
    if let Some(store) = handle.identity() {
        println!("TLS fingerprint: {}", store.current().fingerprint());
    }
    if let Some(addr) = handle.status_addr() {
        println!("Status: http://{}/status", addr);
    }
    println!("Press Ctrl+C to stop");

    shutdown_signal().await;
    handle.stop().await;
    Ok(())
}

/// Exit codes: 2 bind failure, 3 identity failure, 4 configuration or share
/// error, 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<DaemonError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<IdentityError>().is_some() {
        return 3;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 4;
    }
    1
}
