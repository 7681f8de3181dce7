//! Warden SDS server binary
//!
//! `run` serves the secret discovery service from a JSON configuration;
//! `init` bootstraps a local PKI and writes a ready-to-run configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use warden_sds::ca::{self, MiniCa};
use warden_sds::config::{Config, ProvisionerConfig};
use warden_sds::error::Error;
use warden_sds::logging::{self, LoggerConfig};
use warden_sds::sds::Service;

/// Warden SDS - serves TLS certificates to data-plane proxies over xDS
#[derive(Parser, Debug)]
#[command(name = "warden-sds", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SDS server with the given configuration
    Run(RunArgs),

    /// Initialize a local PKI and write a server configuration
    Init(InitArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the JSON configuration (written by `warden-sds init`)
    config: PathBuf,

    /// File containing the password that decrypts the server TLS key
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// File containing the password that decrypts the provisioner key
    #[arg(long)]
    provisioner_password_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InitArgs {
    /// Name of the new PKI
    #[arg(long, default_value = "SDS")]
    name: String,

    /// Listen address written to the configuration
    #[arg(long, default_value = "127.0.0.1:8443")]
    address: String,

    /// Comma-separated DNS names or IPs for the SDS server certificate
    #[arg(long, default_value = "sds.example.com")]
    dns: String,

    /// Common name of the SDS client certificate
    #[arg(long, default_value = "envoy.example.com")]
    client_name: String,

    /// Configure a UNIX domain socket listener instead of TCP
    #[arg(long)]
    uds: bool,

    /// Directory the PKI and configuration are written to
    #[arg(long, default_value = "sds")]
    output_dir: PathBuf,

    /// File containing the password used to encrypt the generated keys
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// URL of the upstream CA written to the provisioner configuration
    #[arg(long, default_value = "")]
    ca_url: String,

    /// Path to the upstream CA root written to the provisioner configuration
    #[arg(long, default_value = "")]
    ca_root: String,

    /// Provisioner issuer written to the configuration
    #[arg(long, default_value = "")]
    provisioner_issuer: String,

    /// Provisioner key id written to the configuration
    #[arg(long, default_value = "")]
    provisioner_kid: String,

    /// Path to the provisioner signing key written to the configuration
    #[arg(long, default_value = "")]
    provisioner_key: String,
}

static STARTED: OnceLock<Instant> = OnceLock::new();

#[tokio::main]
async fn main() {
    STARTED.get_or_init(Instant::now);
    if let Err(err) = run_main().await {
        // STEPDEBUG=1 keeps the full error chain
        if std::env::var("STEPDEBUG").is_ok_and(|v| v == "1") {
            eprintln!("error: {err:?}");
        } else {
            eprintln!("error: {err}");
        }
        std::process::exit(1);
    }
}

async fn run_main() -> Result<(), Error> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::Init(args) => init(args),
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    let mut config = Config::load(&args.config)?;

    // resolve the provisioner password: flag file first, then the config,
    // then an interactive prompt
    if let Some(path) = &args.provisioner_password_file {
        config.provisioner.password = Some(read_password_file(path)?);
    } else if config.provisioner.password.is_none() {
        let password = rpassword::prompt_password(
            "Please enter the password to decrypt the provisioner key: ",
        )?;
        config.provisioner.password = Some(password);
    }

    let logger = LoggerConfig::from_value(&config.logger)?;
    logging::init(&logger);

    if let Ok(addr) = std::env::var("STEP_PROF_ADDR") {
        tokio::spawn(serve_debug(addr));
    }

    let service = Service::new(&config)?;
    let handle = service.clone();
    let shutdown = async move {
        wait_for_signal().await;
        handle.stop();
    };

    let mut builder = Server::builder();
    if config.is_tcp() {
        builder = builder.tls_config(server_tls_config(&config, args.password_file.as_deref())?)?;
        let addr = parse_address(&config.address)?;
        info!(network = %config.network, address = %addr, "serving secret discovery service");
        builder
            .add_service(service.into_service())
            .serve_with_shutdown(addr, shutdown)
            .await?;
    } else {
        // a stale socket from a previous run would fail the bind
        let path = Path::new(&config.address);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!(network = %config.network, address = %config.address, "serving secret discovery service");
        builder
            .add_service(service.into_service())
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await?;
    }

    info!("secret discovery service stopped");
    Ok(())
}

/// TLS settings for the TCP listener: the server identity plus mandatory
/// client certificates against the configured root.
fn server_tls_config(config: &Config, password_file: Option<&Path>) -> Result<ServerTlsConfig, Error> {
    let cert_path = config
        .certificate
        .as_ref()
        .ok_or_else(|| Error::config("crt cannot be empty"))?;
    let key_path = config
        .certificate_key
        .as_ref()
        .ok_or_else(|| Error::config("key cannot be empty"))?;

    let cert_pem = std::fs::read_to_string(cert_path)?;
    let key_pem = std::fs::read_to_string(key_path)?;
    let password = match password_file {
        Some(path) => Some(read_password_file(path)?),
        None => config.password.clone(),
    };
    let key_pem = ca::decrypt_private_key(&key_pem, password.as_deref())?;

    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(&cert_pem, &key_pem));
    if let Some(root) = &config.root {
        let root_pem = std::fs::read_to_string(root)?;
        tls = tls.client_ca_root(Certificate::from_pem(root_pem));
    }
    Ok(tls)
}

/// Parses a listen address, accepting the `:port` shorthand.
fn parse_address(address: &str) -> Result<SocketAddr, Error> {
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    normalized
        .parse()
        .map_err(|e| Error::config(format!("invalid address \"{address}\": {e}")))
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown signal received");
}

/// Serves the profiling endpoint named by `STEP_PROF_ADDR`.
async fn serve_debug(addr: String) {
    use axum::{routing::get, Json, Router};

    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/debug/status",
            get(|| async {
                Json(serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_secs": STARTED.get().map(|s| s.elapsed().as_secs()).unwrap_or(0),
                    "pid": std::process::id(),
                }))
            }),
        );

    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(%addr, "serving profiling endpoint");
            if let Err(err) = axum::serve(listener, router).await {
                tracing::warn!(error = %err, "profiling endpoint stopped");
            }
        }
        Err(err) => tracing::warn!(%addr, error = %err, "failed to bind profiling endpoint"),
    }
}

/// Reads a password file, trimming trailing whitespace.
fn read_password_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.trim_end().to_string())
}

const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn init(args: InitArgs) -> Result<(), Error> {
    logging::init(&LoggerConfig::default());

    let dir = &args.output_dir;
    std::fs::create_dir_all(dir)?;

    let password = match &args.password_file {
        Some(path) => Some(read_password_file(path)?),
        None => None,
    };

    let ca = MiniCa::new(&args.name)?;

    let dns_names: Vec<String> = args
        .dns
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if dns_names.is_empty() {
        return Err(Error::config("at least one DNS name is required"));
    }

    let (server_chain, server_key) = ca.issue(&dns_names[0], &dns_names, LEAF_VALIDITY)?;
    let (client_chain, client_key) =
        ca.issue(&args.client_name, std::slice::from_ref(&args.client_name), LEAF_VALIDITY)?;
    let client_leaf = ca::pem_bundle_to_der(&client_chain)?.remove(0);

    write_cert(&dir.join("root_ca.crt"), ca.root_pem())?;
    write_key(&dir.join("root_ca_key"), ca.root_key_pem(), password.as_deref())?;
    write_cert(&dir.join("intermediate_ca.crt"), ca.intermediate_pem())?;
    write_key(&dir.join("intermediate_ca_key"), ca.intermediate_key_pem(), password.as_deref())?;
    write_cert(&dir.join("sds_server.crt"), &server_chain)?;
    write_key(&dir.join("sds_server_key"), &server_key, password.as_deref())?;
    write_cert(&dir.join("sds_client.crt"), &client_chain)?;
    write_key(&dir.join("sds_client_key"), &client_key, password.as_deref())?;

    let provisioner = ProvisionerConfig {
        issuer: args.provisioner_issuer.clone(),
        key_id: args.provisioner_kid.clone(),
        password: None,
        ca_url: args.ca_url.clone(),
        ca_root: PathBuf::from(&args.ca_root),
        key: if args.provisioner_key.is_empty() {
            None
        } else {
            Some(PathBuf::from(&args.provisioner_key))
        },
    };

    let config = if args.uds {
        Config {
            network: "unix".to_string(),
            address: dir.join("sds.sock").display().to_string(),
            provisioner,
            logger: serde_json::json!({"format": "text"}),
            ..Default::default()
        }
    } else {
        Config {
            network: "tcp".to_string(),
            address: args.address.clone(),
            root: Some(dir.join("root_ca.crt")),
            certificate: Some(dir.join("sds_server.crt")),
            certificate_key: Some(dir.join("sds_server_key")),
            authorized_identity: Some(args.client_name.clone()),
            authorized_fingerprint: Some(ca::fingerprint(&client_leaf)),
            provisioner,
            logger: serde_json::json!({"format": "text"}),
            ..Default::default()
        }
    };

    let config_path = dir.join("sds.json");
    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|e| Error::config(format!("failed to render configuration: {e}")))?;
    std::fs::write(&config_path, rendered + "\n")?;

    println!("PKI and configuration written to {}", dir.display());
    println!("  root:          {}", dir.join("root_ca.crt").display());
    println!("  server:        {}", dir.join("sds_server.crt").display());
    println!("  client:        {}", dir.join("sds_client.crt").display());
    println!("  configuration: {}", config_path.display());
    if config.provisioner.issuer.is_empty() {
        println!();
        println!("Fill in the provisioner section of sds.json before running the server.");
    }
    println!();
    println!("Start the server with: warden-sds run {}", config_path.display());
    Ok(())
}

fn write_cert(path: &Path, pem: &str) -> Result<(), Error> {
    std::fs::write(path, pem)?;
    Ok(())
}

fn write_key(path: &Path, key_pem: &str, password: Option<&str>) -> Result<(), Error> {
    let rendered = ca::serialize_private_key(key_pem, password)?;
    std::fs::write(path, rendered)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
