use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc};

use axum::{
    Router,
    extract::{ConnectInfo, Request},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tollgate::{
    adapters::{
        AdminState, HttpClientAdapter, HttpHandler, MemoryCoordinationStore, RedisCoordinationStore,
        admin_api,
    },
    config::{
        ConfigValidator, CoordinationBackend, CoordinationConfig, GatewayConfig, LogFormat,
        load_config,
    },
    core::GatewayService,
    metrics,
    ports::{clock::SystemClock, coordination_store::CoordinationStore, http_client::HttpClient},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "tollgate.yaml")]
    config: String,

    /// Log filter directive (e.g. "info,tollgate=debug"); overrides RUST_LOG
    #[clap(long, global = true)]
    log_level: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "tollgate.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "tollgate.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "tollgate.yaml")]
        config: String,
    },
}

const MEMORY_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.log_level.as_deref()).await,
        None => serve(&args.config, args.log_level.as_deref()).await,
    }
}

async fn serve(config_path: &str, log_level: Option<&str>) -> Result<()> {
    let config: GatewayConfig = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    ConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;

    let logging = match (log_level, config.telemetry.log_format) {
        (Some(level), format) => {
            tracing_setup::init_tracing_with_config(level, format == LogFormat::Json)
        }
        (None, LogFormat::Json) => tracing_setup::init_tracing(),
        (None, LogFormat::Console) => tracing_setup::init_console_tracing(),
    };
    logging.map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already; continuing.",
            e
        );
    }

    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let store = build_store(&config.coordination, graceful_shutdown.token())?;
    let http_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(config.upstream.timeout)
            .context("Failed to create HTTP client adapter")?,
    );

    let config = Arc::new(config);
    let gateway = Arc::new(
        GatewayService::new(config.clone(), store, Arc::new(SystemClock), http_client)
            .context("Failed to build gateway")?,
    );
    tracing::info!(instance = %gateway.instance_id(), "Gateway instance created");

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    // Another instance holding the bootstrap lock is seeding for us.
    match gateway.bootstrap().await {
        Ok(report) => tracing::info!(?report, "Bootstrap complete"),
        Err(e) => tracing::warn!("Skipping bootstrap seeding: {}", e),
    }

    let sync_tasks = gateway.start_sync(graceful_shutdown.token());

    let http_handler = Arc::new(HttpHandler::new(
        gateway.pipeline().clone(),
        gateway.instance_id(),
    ));
    let data_plane = data_plane_router(http_handler);
    let admin = admin_api::router(
        AdminState::from_pipeline(gateway.pipeline()).with_token(config.admin_token.clone()),
    );

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let app = match &config.admin_listen_addr {
        Some(admin_addr) => {
            let admin_addr: SocketAddr = admin_addr
                .parse()
                .context("Failed to parse admin listen address")?;
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .context("Failed to bind management API address")?;
            tracing::info!("Management API listening on {}", admin_addr);
            let token = graceful_shutdown.token();
            tokio::spawn(async move {
                let result = axum::serve(
                    admin_listener,
                    admin.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
                if let Err(e) = result {
                    tracing::error!("Management API server error: {}", e);
                }
            });
            data_plane
        }
        None if config.admin_token.is_some() => admin.merge(data_plane),
        None => {
            tracing::warn!(
                "Management API disabled: set admin_listen_addr or admin_token to enable it"
            );
            data_plane
        }
    };

    for route in &config.routes {
        tracing::info!(
            route = %route.id,
            prefix = %route.predicate.path_prefix,
            upstreams = ?route.upstreams,
            "Configured bootstrap route"
        );
    }

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Tollgate listening on {} (coordination: {:?}, admin: {})",
        addr,
        config.coordination.backend,
        admin_location(&config)
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful_shutdown.token().cancelled_owned())
    .into_future();

    let drain_timeout = graceful_shutdown.drain_timeout();
    let drained = drain_deadline(graceful_shutdown.token(), drain_timeout);
    tokio::select! {
        result = server => result.context("Server error")?,
        _ = drained => tracing::warn!(
            "In-flight requests did not finish within {:?}; exiting",
            drain_timeout
        ),
    }

    // Server can also stop on its own; make sure followers stop too.
    if !graceful_shutdown.is_shutdown_initiated() {
        graceful_shutdown.trigger_shutdown(ShutdownReason::Requested);
    }
    for task in sync_tasks {
        if let Err(e) = task.await {
            tracing::warn!("Sync task ended abnormally: {}", e);
        }
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

fn data_plane_router(handler: Arc<HttpHandler>) -> Router {
    Router::new().fallback(
        move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
            let handler = handler.clone();
            async move { handler.handle_request(req, Some(client_addr)).await }
        },
    )
}

fn admin_location(config: &GatewayConfig) -> &str {
    match (&config.admin_listen_addr, &config.admin_token) {
        (Some(addr), _) => addr,
        (None, Some(_)) => "/admin on the main listener",
        (None, None) => "disabled",
    }
}

async fn drain_deadline(token: CancellationToken, drain_timeout: std::time::Duration) {
    token.cancelled().await;
    tokio::time::sleep(drain_timeout).await;
}

/// Build the configured store. Neither backend touches the network here, so an
/// unreachable Redis leaves the gateway running fail-closed until it answers.
fn build_store(config: &CoordinationConfig, cancel: CancellationToken) -> Result<Arc<dyn CoordinationStore>> {
    match config.backend {
        CoordinationBackend::Memory => {
            tracing::warn!(
                "Using the in-memory coordination store; state is not shared with other instances"
            );
            let store = Arc::new(MemoryCoordinationStore::new());
            store.spawn_sweeper(MEMORY_SWEEP_INTERVAL, cancel);
            Ok(store)
        }
        CoordinationBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| eyre!("coordination.redis_url is required for the redis backend"))?;
            let store = RedisCoordinationStore::new(url, config.key_prefix.clone())
                .context("Invalid coordination.redis_url")?;
            Ok(Arc::new(store))
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!(
                "   • Management API: {}",
                admin_location(&config)
            );
            println!("   • Coordination: {:?}", config.coordination.backend);
            println!("   • Routes: {}", config.routes.len());
            println!("   • Rate limit templates: {}", config.rate_limits.len());
            println!(
                "   • Admission: {:?} ({} entries)",
                config.admission.mode,
                config.admission.entries.len()
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all upstream URLs start with http:// or https://");
            println!("   • Route path prefixes must start with '/'");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Durations use humantime units (e.g., '250ms', '1s', '5m')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Tollgate configuration

listen_addr: "127.0.0.1:8080"
# admin_listen_addr: "127.0.0.1:9090"   # management API on its own listener
# admin_token: "change-me"               # required bearer token; also mounts
#                                        # /admin on the main listener

coordination:
  backend: memory            # memory | redis
  # redis_url: "redis://127.0.0.1:6379"
  key_prefix: tollgate
  operation_timeout: 500ms

client_address:
  forwarded_header: x-forwarded-for
  max_hops: 1                # entries considered
  strategy: left_most        # left_most | right_most_trusted

telemetry:
  correlation_header: x-correlation-id
  slow_request_threshold: 1s
  log_format: json           # json | console

admission:
  mode: deny_list            # allow_list | deny_list
  entries: []
  exempt_internal_networks: false

rate_limits:
  per-client:
    capacity: 100
    refill_tokens: 100
    window: 1m
    key_by:
      type: client_address

default_rate_limits: []

routes:
  - id: api
    predicate:
      path_prefix: /api
    upstreams:
      - http://localhost:3000
    strategy: round_robin
    rate_limit: per-client
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'tollgate serve --config {config_path}' to start the gateway");
    Ok(())
}
