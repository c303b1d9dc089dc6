//! tunnel-server-demo: a thin CLI binary wiring config, TLS material, and
//! logging around [`tunnel_server::TunnelServer`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tunnel_server::{ServerConfigFile, TunnelServer};

/// tunnel-server-demo — reverse TCP tunnel server
#[derive(Parser, Debug)]
#[command(name = "tunnel-server-demo", version, about = "Reverse TCP tunnel server")]
struct Cli {
    /// Config file path (TOML)
    #[arg(long, default_value = "~/.tunnel/server.toml")]
    config: String,

    /// Address the client-facing TLS listener binds to
    #[arg(long)]
    bind_addr: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// CA bundle trusted to sign client certificates (PEM)
    #[arg(long)]
    client_ca: Option<String>,

    /// Generate a self-signed certificate for development use
    #[arg(long)]
    generate_cert: bool,

    /// Authorize any peer presenting a valid certificate on first contact
    #[arg(long)]
    auto_subscribe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config_path = expand_home(&cli.config);
    let mut config = match load_config_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load config, using defaults");
            ServerConfigFile::default()
        }
    };
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = Some(bind_addr);
    }
    if cli.auto_subscribe {
        config.auto_subscribe = Some(true);
    }

    let server_config = match config.resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid server config");
            std::process::exit(1);
        }
    };

    let (cert_path, key_path) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        let cert = cli.cert.map(PathBuf::from).unwrap_or_else(|| {
            error!("--cert is required without --generate-cert");
            std::process::exit(1);
        });
        let key = cli.key.map(PathBuf::from).unwrap_or_else(|| {
            error!("--key is required without --generate-cert");
            std::process::exit(1);
        });
        (cert, key)
    };
    let client_ca_path = cli.client_ca.map(PathBuf::from).unwrap_or(cert_path.clone());

    let tls_config = match load_tls_config(&cert_path, &key_path, &client_ca_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load TLS config");
            std::process::exit(1);
        }
    };

    info!(bind_addr = %server_config.bind_addr, "starting tunnel-server-demo");
    let server = TunnelServer::new(server_config, Arc::new(tls_config));

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            server.stop();
        }
    }

    info!("tunnel-server-demo stopped");
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn load_config_file(path: &std::path::Path) -> Result<ServerConfigFile, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load the server's TLS config: its own cert/key, plus the CA bundle it
/// trusts to have signed client certificates.
fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
    client_ca_path: &std::path::Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;
    let ca_pem = std::fs::read(client_ca_path)
        .map_err(|e| format!("cannot read client CA {}: {e}", client_ca_path.display()))?;

    let certs = tunnel_core::tls::parse_certs(&cert_pem)?;
    let key = tunnel_core::tls::parse_private_key(&key_pem)?;
    let roots = tunnel_core::tls::root_store(&ca_pem)?;

    Ok(tunnel_core::tls::server_tls_config(certs, key, roots)?)
}

/// Generate a self-signed certificate for development use, acting as both
/// the server's own identity and the client CA it trusts.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tunnel");
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("server-cert.pem");
    let key_path = dir.join("server-key.pem");

    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "tunnel-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
