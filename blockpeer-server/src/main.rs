mod app;
mod config;
mod error;
mod runtime_integration;
mod util;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use blockpeer_cache::BlockCache;
use blockpeer_proxy::{Advertiser, DirLocalStore, LocalStore, NullLocalStore, PrefetchPool, RemoteReader};
use blockpeer_router::{Libp2pRouter, Libp2pRouterConfig, MockRouter, PeerId, Router};
use clap::Parser;
use log::{error, info};
use pingora::listeners::tls::TlsSettings;
use pingora::server::configuration::{Opt, ServerConf};
use pingora::server::Server;
use pingora::services::listening::Service;

use crate::app::PeerdApp;
use crate::config::Config;

fn build_router(config: &Config) -> Result<Arc<dyn Router>, anyhow::Error> {
    match &config.router_addr {
        Some(listen_addr) => {
            let keypair = libp2p::identity::Keypair::generate_ed25519();
            let listen_addr: libp2p::Multiaddr = listen_addr.parse()?;
            let http_port: u16 = config
                .http_addr
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
                .unwrap_or(7070);

            let mut bootstrap_peers: Vec<(libp2p::PeerId, libp2p::Multiaddr)> = Vec::new();
            for entry in &config.bootstrap_peer {
                let (id, addr) = entry
                    .split_once('@')
                    .ok_or_else(|| anyhow::anyhow!("bootstrap peer must be <peer-id>@<multiaddr>: {entry}"))?;
                bootstrap_peers.push((id.parse()?, addr.parse()?));
            }

            let router = Libp2pRouter::new(
                keypair,
                Libp2pRouterConfig {
                    listen_addr,
                    bootstrap_peers,
                    http_port,
                    protocol_version: "/blockpeer/kad/1.0.0".to_string(),
                    negative_cache_ttl: Duration::from_secs(config.negative_cache_ttl_secs),
                },
            )?;
            Ok(Arc::new(router))
        }
        None => {
            info!("no --router-addr given, running with an in-memory mock router");
            Ok(Arc::new(MockRouter::new(
                PeerId("local".to_string()),
                format!("http://{}", config.http_addr),
                HashMap::new(),
            )))
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let config = Config::parse();
    util::setup_logs(&config.log_level);
    info!("starting with config {:#?}", config);
    runtime_integration::apply(&config);

    let (cache, new_block_rx) = match BlockCache::builder(&config.cache_root)
        .capacity(config.cache_capacity)
        .evict_pct(config.cache_evict_pct)
        .build()
    {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to open block cache at {:?}: {e}", config.cache_root);
            std::process::exit(1);
        }
    };

    let router = match build_router(&config) {
        Ok(router) => router,
        Err(e) => {
            error!("failed to start router: {e}");
            std::process::exit(1);
        }
    };

    let local_store: Arc<dyn LocalStore> = match &config.content_dir {
        Some(dir) => Arc::new(DirLocalStore::new(dir.clone())),
        None => Arc::new(NullLocalStore),
    };
    let remote = Arc::new(RemoteReader::new(router.clone(), config.resolve_retries));

    let prefetch_pool = PrefetchPool::new(cache.clone(), config.prefetch_workers);
    let prefetch_handle = prefetch_pool.handle();

    let advertiser = Advertiser::new();
    tokio::spawn(advertiser.clone().run(router.clone(), new_block_rx));

    let app = PeerdApp {
        cache,
        router: router.clone(),
        local_store,
        remote,
        prefetch: prefetch_handle,
        resolve_timeout: Duration::from_millis(config.resolve_timeout_ms),
        resolve_retries: config.resolve_retries,
    };

    let opt = Some(Opt {
        upgrade: false,
        daemon: false,
        nocapture: false,
        test: false,
        conf: None,
    });
    let conf = ServerConf::default();
    let mut my_server = Server::new_with_opt_and_conf(opt, conf);
    my_server.bootstrap();

    let mut blockpeer_service = Service::new("blockpeerd".to_string(), app.clone());
    blockpeer_service.add_tcp(&config.http_addr);
    info!("listening on {}", config.http_addr);
    my_server.add_service(blockpeer_service);

    // spec.md §6: the HTTP API is served on both a plain and a TLS port.
    if let Some(https_addr) = &config.https_addr {
        let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path)
        else {
            error!("--https-addr given without --tls-cert-path/--tls-key-path");
            std::process::exit(1);
        };
        let mut tls_settings = match TlsSettings::intermediate(
            &cert_path.to_string_lossy(),
            &key_path.to_string_lossy(),
        ) {
            Ok(settings) => settings,
            Err(e) => {
                error!("failed to load TLS cert/key for {https_addr}: {e}");
                std::process::exit(1);
            }
        };
        tls_settings.enable_h2();
        let mut blockpeer_tls_service = Service::new("blockpeerd-tls".to_string(), app);
        blockpeer_tls_service.add_tls_with_settings(https_addr, None, tls_settings);
        info!("listening (TLS) on {https_addr}");
        my_server.add_service(blockpeer_tls_service);
    }

    if let Some(prom_addr) = &config.prom_addr {
        let mut prometheus_service = Service::prometheus_http_service();
        prometheus_service.add_tcp(prom_addr);
        info!("prometheus metrics on {}", prom_addr);
        my_server.add_service(prometheus_service);
    }

    // SIGTERM -> pingora's own graceful-drain handling inside run_forever;
    // the router's Close (spec §9) happens on process exit here since
    // nothing else owns its lifetime once the listeners stop accepting.
    my_server.run_forever();
}
