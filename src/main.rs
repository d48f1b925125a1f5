use clap::{Arg, Command};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use object_gateway::{
    config::GatewayConfig,
    http_origin::HttpBlobStore,
    kv_cache::ChunkedKvCache,
    logging::init_logging,
    memory::{MemoryEdgeCache, MemoryKvStore},
    router::BucketRouter,
    service::ObjectService,
    stores::BlobStore,
    GatewayError, Result,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

fn parse_args() -> Option<PathBuf> {
    let matches = Command::new("object-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Edge object gateway with a two-tier read-through cache")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the YAML configuration file"),
        )
        .get_matches();

    matches.get_one::<String>("config").map(PathBuf::from)
}

fn build_service(config: Arc<GatewayConfig>) -> Result<ObjectService> {
    let mut bindings: HashMap<String, Arc<dyn BlobStore>> = HashMap::new();
    for (bucket, endpoint) in &config.origins {
        bindings.insert(
            bucket.clone(),
            Arc::new(HttpBlobStore::new(endpoint.clone())) as Arc<dyn BlobStore>,
        );
    }
    if bindings.is_empty() {
        return Err(GatewayError::Config(
            "no origin endpoints configured under `origins`".to_string(),
        ));
    }

    let router = BucketRouter::new(
        config.routes.clone(),
        config.default_bucket.clone(),
        bindings,
    );

    let edge_cache = Arc::new(MemoryEdgeCache::new(config.cache.fast_cache_cap));
    let kv_store = Arc::new(MemoryKvStore::new());
    let kv_cache = Arc::new(ChunkedKvCache::new(kv_store, config.cache.kv.clone()));

    Ok(ObjectService::new(config, router, edge_cache, Some(kv_cache)))
}

async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return signal::ctrl_c().await.unwrap_or(());
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match parse_args() {
        Some(path) => GatewayConfig::load_from(&path)?,
        None => {
            let config = GatewayConfig::default();
            config.validate()?;
            config
        }
    };
    let config = Arc::new(config);

    init_logging(&config.logging)?;

    let service = Arc::new(build_service(Arc::clone(&config))?);
    let tasks = service.background_tasks();

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid bind address: {}", e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Io(format!("failed to bind {}: {}", addr, e)))?;

    info!("object gateway listening on {}", addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let service = Arc::clone(&service);

                tokio::spawn(async move {
                    let handler = service_fn(move |req| {
                        let service = Arc::clone(&service);
                        async move { Ok::<_, Infallible>(service.handle(req).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                        error!("error serving connection from {}: {}", peer, e);
                    }
                });
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }

    // Let in-flight cache populates finish before exiting
    tasks.wait_idle().await;
    info!("shutdown complete");
    Ok(())
}
