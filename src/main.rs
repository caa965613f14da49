#![allow(clippy::upper_case_acronyms)]

use std::{process, sync::Arc, time::Duration};

use pingora::services::listening::Service;
use pingora_core::{
    apps::HttpServerOptions,
    server::{configuration::Opt, Server},
    services::background::background_service,
};
use pingora_proxy::{http_proxy_service_with_name, HttpProxy};
use sentry::IntoDsn;

use offline_gateway::{
    cache::{build_backend, CacheStoreManager},
    config::Config,
    core::CacheResult,
    intercept::CacheWorker,
    logging::Logger,
    network::UpstreamFetcher,
    service::{ClientExpiry, ControlHttpApp, GatewayService, WorkerBootstrap},
};

// Service name constants
const GATEWAY_SERVICE: &str = "offline-gateway";

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let mut config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    // Open the cache stores before serving
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start bootstrap runtime: {e}");
            process::exit(1);
        }
    };
    let worker = match runtime.block_on(build_worker(&config)) {
        Ok(worker) => worker,
        Err(e) => {
            eprintln!("Failed to initialize cache worker: {e}");
            process::exit(1);
        }
    };
    drop(runtime);

    // Create server instance
    let mut gateway_server = Server::new_with_opt_and_conf(Some(cli_options), std::mem::take(&mut config.pingora));

    // Add log service
    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        gateway_server.add_service(log_service);
    }

    // Install and activate the configured generation in the background
    log::info!("Adding cache bootstrap service...");
    gateway_server.add_service(background_service(
        "cache bootstrap",
        WorkerBootstrap::new(worker.clone(), &config.cache.version),
    ));

    gateway_server.add_service(background_service(
        "client expiry",
        ClientExpiry::new(
            worker.clone(),
            Duration::from_secs(config.cache.client_idle_timeout),
        ),
    ));

    let gateway = match GatewayService::new(worker.clone(), &config.origin) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Failed to initialize gateway: {e}");
            process::exit(1);
        }
    };
    let mut http_service =
        http_proxy_service_with_name(&gateway_server.configuration, gateway, GATEWAY_SERVICE);

    // Add listeners
    log::info!("Adding listeners...");
    if let Err(e) = add_listeners(&mut http_service, &config) {
        eprintln!("Failed to add listeners: {e}");
        process::exit(1);
    }

    // Add optional services (Sentry, Prometheus, Control)
    if let Err(e) = add_optional_services(&mut gateway_server, &config, worker) {
        eprintln!("Failed to add services: {e}");
        process::exit(1);
    }

    // Start server
    log::info!("Bootstrapping...");
    gateway_server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    gateway_server.add_service(http_service);

    log::info!("Starting Server...");
    gateway_server.run_forever();
}

/// Open the configured stores, assemble the worker and resume a stored
/// generation.
async fn build_worker(config: &Config) -> CacheResult<Arc<CacheWorker>> {
    let backend = build_backend(&config.cache.storage).await?;
    let fetcher = Arc::new(UpstreamFetcher::new(&config.origin)?);
    let worker = CacheWorker::new(CacheStoreManager::new(backend), fetcher, &config.cache)?;
    // Serve what a previous run cached until the origin can be reached.
    if worker.resume(&config.cache.version).await? {
        log::info!("Resumed generation {} from storage", config.cache.version);
    }
    Ok(Arc::new(worker))
}

/// Add listeners for the gateway service
fn add_listeners(
    http_service: &mut Service<HttpProxy<GatewayService>>,
    cfg: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    for list_cfg in cfg.listeners.iter() {
        if list_cfg.offer_h2c {
            let http_logic = http_service
                .app_logic_mut()
                .ok_or("Failed to get app logic")?;
            let mut http_server_options = HttpServerOptions::default();
            http_server_options.h2c = true;
            http_logic.server_options = Some(http_server_options);
        }
        http_service.add_tcp(&list_cfg.address.to_string());
    }
    Ok(())
}

/// Add optional services (Sentry, Prometheus, Control)
fn add_optional_services(
    server: &mut Server,
    cfg: &Config,
    worker: Arc<CacheWorker>,
) -> CacheResult<()> {
    if let Some(sentry_cfg) = &cfg.sentry {
        log::info!("Adding Sentry config...");
        match sentry_cfg.dsn.clone().into_dsn() {
            Ok(Some(dsn)) => {
                server.sentry = Some(sentry::ClientOptions {
                    dsn: Some(dsn),
                    ..Default::default()
                });
            }
            Ok(None) => log::warn!("Sentry DSN is empty or invalid, Sentry disabled."),
            Err(e) => log::error!("Error parsing Sentry DSN: {e}"),
        }
    }

    if let Some(control_cfg) = &cfg.control {
        log::info!("Adding Control HTTP...");
        let control_service_http = ControlHttpApp::control_http_service(control_cfg, worker)?;
        server.add_service(control_service_http);
    }

    if let Some(prometheus_cfg) = &cfg.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    Ok(())
}
