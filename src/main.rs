use std::sync::Arc;

use http::HeaderValue;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use storefront_payments as app;
use app::{
    auth::{CredentialVerifier, JwtCredentialVerifier},
    gateway::{HttpPaymentGateway, PaymentGateway},
    repositories::{InMemoryOrderStore, OrderStore, SeaOrmOrderStore},
    services::{DbInventoryAdjuster, InMemoryInventoryAdjuster, InventoryAdjuster},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = app::config::load_config()?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);
    app::handlers::health::init_start_time();

    // Order store and stock adjuster
    let (store, adjuster): (Arc<dyn OrderStore>, Arc<dyn InventoryAdjuster>) =
        if cfg.uses_memory_store() {
            warn!("Using the in-memory order store; orders and stock are lost on restart");
            (
                Arc::new(InMemoryOrderStore::new()),
                Arc::new(InMemoryInventoryAdjuster::new()),
            )
        } else {
            let db_pool = app::db::establish_connection_from_app_config(&cfg).await?;
            if cfg.auto_migrate {
                app::db::create_schema(&db_pool).await.map_err(|e| {
                    error!("Failed creating schema: {}", e);
                    e
                })?;
            }
            let db_arc = Arc::new(db_pool);
            (
                Arc::new(SeaOrmOrderStore::new(db_arc.clone())),
                Arc::new(DbInventoryAdjuster::new(db_arc)),
            )
        };

    // Payment gateway client
    let http_gateway = HttpPaymentGateway::new(&cfg.gateway)?;
    if cfg.gateway.register_ipn_on_startup && cfg.gateway.ipn_id.is_none() {
        if let Some(ipn_url) = cfg.gateway.ipn_url.clone() {
            match http_gateway.register_ipn(&ipn_url).await {
                Ok(registration) => {
                    info!(ipn_id = %registration.ipn_id, "Registered IPN URL with the gateway");
                    cfg.gateway.ipn_id = Some(registration.ipn_id);
                }
                Err(e) => {
                    error!("IPN registration failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
    let gateway: Arc<dyn PaymentGateway> = Arc::new(http_gateway);

    let notifier = app::notifications::dispatcher_from_config(&cfg.notifications)?;
    if cfg.notifications.webhook_url.is_some() {
        info!("Order notification relay enabled");
    } else {
        info!("Order notification relay not configured; notifications are only logged");
    }

    let verifier: Arc<dyn CredentialVerifier> = Arc::new(JwtCredentialVerifier::new(&cfg.jwt_secret));

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS because explicit origins were not configured (development environment)");
        CorsLayer::permissive()
    } else {
        error!("Missing CORS configuration detected; set APP__CORS_ALLOWED_ORIGINS");
        return Err("Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS".into());
    };

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let app_state = app::AppState::new(cfg, store, gateway, adjuster, notifier, verifier);
    let router = app::app_router(app_state).layer(cors_layer);

    // Bind and serve
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("storefront-payments listening on http://{}", addr);

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
