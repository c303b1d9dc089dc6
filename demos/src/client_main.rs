//! tunnel-client-demo: a thin CLI binary wiring config, TLS material, and
//! logging around [`tunnel_client::TunnelClient`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tunnel_client::{ClientConfigFile, TunnelClient};

/// tunnel-client-demo — reverse TCP tunnel client
#[derive(Parser, Debug)]
#[command(name = "tunnel-client-demo", version, about = "Reverse TCP tunnel client")]
struct Cli {
    /// Config file path (TOML)
    #[arg(long, default_value = "~/.tunnel/client.toml")]
    config: String,

    /// Address of the tunnel server's client-facing TLS listener
    #[arg(long)]
    server_addr: Option<String>,

    /// Hostname used for TLS server-name verification
    #[arg(long)]
    server_name: Option<String>,

    /// This client's TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// This client's TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// CA bundle trusted to have signed the server's certificate (PEM)
    #[arg(long)]
    server_ca: Option<String>,

    /// Generate a self-signed certificate for development use
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config_path = expand_home(&cli.config);
    let mut file_config = match load_config_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load config");
            std::process::exit(1);
        }
    };
    if let Some(server_addr) = cli.server_addr {
        file_config.server_addr = Some(server_addr);
    }
    if let Some(server_name) = cli.server_name {
        file_config.server_name = Some(server_name);
    }

    let client_config = match file_config.resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid client config");
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
    let server_ca_path = cli.server_ca.map(PathBuf::from).unwrap_or(cert_path.clone());

    let tls_config = match load_tls_config(&cert_path, &key_path, &server_ca_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load TLS config");
            std::process::exit(1);
        }
    };

    info!(server_addr = %client_config.server_addr, "starting tunnel-client-demo");
    let client = TunnelClient::new(client_config, Arc::new(tls_config));
    client.start().await;

    shutdown_signal().await;
    info!("received shutdown signal");
    client.stop().await;
    info!("tunnel-client-demo stopped");
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

fn load_config_file(path: &std::path::Path) -> Result<ClientConfigFile, Box<dyn std::error::Error>> {
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

/// Load the client's TLS config: its own cert/key (presented for mutual
/// authentication), plus the CA bundle it trusts to have signed the
/// server's certificate.
fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
    server_ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;
    let ca_pem = std::fs::read(server_ca_path)
        .map_err(|e| format!("cannot read server CA {}: {e}", server_ca_path.display()))?;

    let certs = tunnel_core::tls::parse_certs(&cert_pem)?;
    let key = tunnel_core::tls::parse_private_key(&key_pem)?;
    let roots = tunnel_core::tls::root_store(&ca_pem)?;

    Ok(tunnel_core::tls::client_tls_config(certs, key, roots)?)
}

/// Generate a self-signed certificate for development use, acting as both
/// the client's own identity and the server CA it trusts.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tunnel");
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("client-cert.pem");
    let key_path = dir.join("client-key.pem");

    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "tunnel-client dev cert");

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
