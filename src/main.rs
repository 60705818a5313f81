use std::net::SocketAddr;

use anyhow::Context;
use tracing::{info, warn};

use ww_signal::config::RelayConfig;
use ww_signal::{http, telemetry};

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Install rustls CryptoProvider (required by rustls 0.23+) ────────
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // ── Load configuration ──────────────────────────────────────────────
    let cfg = RelayConfig::from_env();
    telemetry::init_tracing("ww-relay", &cfg.log);
    cfg.log_summary();

    let bind_addr = cfg.bind_addr();
    let serve_tls = cfg.tls_enabled && cfg.tls_material_present();
    if cfg.tls_enabled && !serve_tls {
        warn!(
            cert = %cfg.tls_cert_path.display(),
            key = %cfg.tls_key_path.display(),
            "TLS requested but certificate files are missing; falling back to HTTP"
        );
    }
    let tls_paths = (cfg.tls_cert_path.clone(), cfg.tls_key_path.clone());

    let (app, _state) = http::build_app(cfg);

    // ── Start server (plain HTTP or HTTPS) ──────────────────────────────

    if serve_tls {
        let (cert_path, key_path) = tls_paths;
        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                .await
                .context("failed to load TLS configuration")?;
        info!("TLS configuration loaded");

        let addr: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("invalid bind address {bind_addr}"))?;
        info!("ww-relay listening on https://{bind_addr}");

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        info!("ww-relay listening on http://{bind_addr}");

        axum::serve(listener, app).await?;
    }

    Ok(())
}
