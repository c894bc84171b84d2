use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use torus::component::proxy::{Directory, RpcClient, LOCATOR_NAME};
use torus::component::{server, Dispatcher};
use torus::config::{TorusConfig, DEFAULT_CONFIG_PATH};
use torus::error::TorusError;
use torus::locator;
use torus::partition::FileTopology;
use torus::shutdown::shutdown_token;
use torus::system;
use torus::tls::TlsIdentity;

/// Cadence of locator re-registration. Must stay well inside the
/// locator's passive expiry window.
const REGISTRATION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "torus")]
#[command(version)]
#[command(about = "Partitioned-cluster system daemon and service locator")]
#[command(propagate_version = true)]
struct Args {
    /// Daemon configuration file
    #[arg(long, short = 'C', global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the system component (partition graph and process groups)
    System(DaemonArgs),

    /// Start the service-location component
    Locator(DaemonArgs),

    /// Call a method on a component and print the JSON result
    Call(CallArgs),
}

#[derive(Parser, Debug)]
struct DaemonArgs {
    /// Write the daemon pid to this file once the listener is bound
    #[arg(long, short = 'D')]
    pidfile: Option<PathBuf>,

    /// Do not register with the service-location component
    #[arg(long)]
    no_register: bool,
}

#[derive(Parser, Debug)]
struct CallArgs {
    /// Component name from the config, or a full http(s) URL
    component: String,

    /// Method to invoke
    method: String,

    /// Positional parameters, each parsed as JSON (bare words as strings)
    params: Vec<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// A missing config file is not fatal; every setting has a default and
/// single-host setups run fine without one.
fn load_config(path: &Path) -> Result<TorusConfig, TorusError> {
    if path.exists() {
        TorusConfig::load(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(TorusConfig::default())
    }
}

async fn run_component(
    config: TorusConfig,
    mut dispatcher: Dispatcher,
    args: DaemonArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let tls = TlsIdentity::load(&config.tls).await?;
    if tls.is_some() {
        tracing::info!("TLS material validated");
    }

    let name = dispatcher.name().to_string();
    let addr = config.bind_addr(&name)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    if let Some(pidfile) = &args.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    }

    let scheme = if tls.is_some() { "https" } else { "http" };
    let location = config
        .component_url(&name)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}://{}", scheme, local));

    // The locator never chases its own tail.
    let register = !args.no_register && name != LOCATOR_NAME;
    let locator_url = config.component_url(LOCATOR_NAME).map(str::to_string);
    let registration = match (locator_url, register) {
        (Some(url), true) => {
            let client = RpcClient::new(config.auth.clone())?;
            let beat_client = client.clone();
            let beat_name = name.clone();
            let beat_location = location.clone();
            let beat_url = url.clone();
            dispatcher.automatic("register-location", REGISTRATION_INTERVAL, move || {
                let client = beat_client.clone();
                let name = beat_name.clone();
                let location = beat_location.clone();
                let url = beat_url.clone();
                Box::pin(async move {
                    client
                        .call(&url, "register", vec![json!(name), json!(location)])
                        .await?;
                    Ok(())
                })
            });
            Some((client, url))
        }
        (None, true) => {
            tracing::warn!("no service-location address configured, running unregistered");
            None
        }
        (_, false) => None,
    };

    let token = shutdown_token();
    let outcome = server::serve(dispatcher, listener, config.auth.clone(), token).await;

    if let Some((client, url)) = registration {
        if let Err(e) = client.call(&url, "unregister", vec![json!(name)]).await {
            tracing::warn!(error = %e, "could not unregister from service location");
        }
    }
    if let Some(pidfile) = &args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    outcome?;
    Ok(())
}

/// Each parameter is JSON when it parses as JSON and a bare string
/// otherwise, so `torus call system reserve_partition P64 64` does what
/// it looks like.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_call(
    config_path: &Path,
    args: CallArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = if config_path.exists() {
        TorusConfig::load(config_path)?
    } else {
        TorusConfig::default()
    };
    let client = RpcClient::new(config.auth.clone())?;
    let params: Vec<Value> = args.params.iter().map(|raw| parse_param(raw)).collect();

    let result = if args.component.contains("://") {
        client.call(&args.component, &args.method, params).await?
    } else {
        let directory = Directory::new(config.components.clone(), client);
        directory.call(&args.component, &args.method, params).await?
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::System(daemon) => {
            init_tracing();
            let config = load_config(&args.config)?;
            let topology = config.system.topology.clone().ok_or(
                "system component requires a topology file in [system] of the config",
            )?;
            let source = Arc::new(FileTopology::new(topology));
            let (dispatcher, _state) = system::build(&config.system, source)?;
            run_component(config, dispatcher, daemon).await?;
        }
        Commands::Locator(daemon) => {
            init_tracing();
            let config = load_config(&args.config)?;
            let (dispatcher, _state) = locator::build(&config.locator, config.auth.clone())?;
            run_component(config, dispatcher, daemon).await?;
        }
        Commands::Call(call) => {
            run_call(&args.config, call).await?;
        }
    }

    Ok(())
}
