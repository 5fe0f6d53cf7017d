//! Recoup - Anomaly Detection & Claim Filing Engine for FBA Sellers
//! Mission: Find every dollar the marketplace owes a seller, with evidence
//!
//! Pipeline: queue -> rule engine -> evidence + policy windows -> SSE fan-out

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, time::interval};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recoup_backend::{
    api::{self, ApiState},
    auth::JwtGate,
    commission::{previous_billing_period, CommissionEngine},
    evidence::{BlobStore, EvidenceBuilder, FsBlobStore, S3BlobStore},
    models::Config,
    orchestrator::{Orchestrator, OrchestratorConfig},
    policy::PolicyTracker,
    queue::{DetectionQueue, QueueConfig},
    rules,
    sse::{
        routes::{self as sse_routes, SseState},
        EventName, SseHub,
    },
    storage::{ContextCache, ResultsStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("🚀 Recoup Detection Engine starting");
    info!("📊 Database at: {}", config.database_path);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Shared stores. Queue and results live in the same SQLite file; both use
    // WAL so reads stay concurrent with worker writes.
    let store = Arc::new(
        ResultsStore::new(&config.database_path).context("Failed to open results store")?,
    );
    let queue = Arc::new(
        DetectionQueue::new(
            &config.database_path,
            QueueConfig {
                backpressure_threshold: config.backpressure_threshold,
                max_concurrency: config.max_concurrency,
                max_attempts: config.max_attempts,
                ..QueueConfig::default()
            },
        )
        .context("Failed to open detection queue")?,
    );

    // Evidence blob store: S3-compatible bucket when configured, local
    // directory otherwise.
    let blob: Arc<dyn BlobStore> = match &config.blob_bucket {
        Some(bucket) => {
            info!("🪣 Evidence bucket: {}", bucket);
            Arc::new(S3BlobStore::from_env(bucket.clone()).await)
        }
        None => {
            warn!(
                "⚠️  BLOB_BUCKET not set - storing evidence under {}",
                config.blob_local_root
            );
            Arc::new(FsBlobStore::new(config.blob_local_root.clone()))
        }
    };
    let evidence = Arc::new(EvidenceBuilder::new(blob));

    let hub = Arc::new(SseHub::new());
    let gate = Arc::new(JwtGate::new(config.jwt_secret.clone(), config.sse_demo_mode));
    if config.sse_demo_mode {
        info!("🧪 SSE demo mode enabled (unauthenticated clients get a reduced stream)");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Orchestrator::new(
        queue.clone(),
        store.clone(),
        Arc::new(ContextCache::new(store.clone())),
        evidence,
        hub.clone(),
        rules::default_registry(),
        OrchestratorConfig {
            max_concurrency: config.max_concurrency,
            downstream_filing_url: config.downstream_filing_url.clone(),
            ..OrchestratorConfig::default()
        },
        shutdown_rx.clone(),
    );
    orchestrator.spawn_workers();

    // Daily billing sweep: invoice the previous period's confirmed matches,
    // finalize invoices whose 24h dispute window has closed.
    {
        let commission = CommissionEngine::new(store.clone(), config.commission_rate);
        let mut shutdown = shutdown_rx.clone();
        info!(
            "💰 Commission engine ready (rate {:.0}%)",
            config.commission_rate * 100.0
        );
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(86_400));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let period = previous_billing_period(chrono::Utc::now());
                        match commission.run_billing_sweep(&period) {
                            Ok((0, 0)) => {}
                            Ok((generated, finalized)) => info!(
                                period = %period,
                                generated, finalized, "🧾 Billing sweep completed"
                            ),
                            Err(e) => warn!(error = %e, "billing sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Stall reaper: jobs stuck in processing flow back through the failure
    // path, so attempts and backoff still apply.
    {
        let queue = queue.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.reap_stalled() {
                            warn!(error = %e, "stall reaper sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Hourly expiration sweep: deadline alerts per seller, expired claims
    // flipped terminal, operators notified over SSE.
    {
        let store = store.clone();
        let hub = hub.clone();
        let tracker = PolicyTracker::new(store.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sellers = match store.sellers_with_pending() {
                            Ok(sellers) => sellers,
                            Err(e) => {
                                warn!(error = %e, "expiration sweep could not list sellers");
                                continue;
                            }
                        };
                        for seller in sellers {
                            match tracker.send_expiration_alerts(&seller) {
                                Ok(0) => {}
                                Ok(alerts) => {
                                    hub.send_event(
                                        &seller,
                                        EventName::Notifications,
                                        serde_json::json!({
                                            "lifecycle": "expiration_alerts",
                                            "alerts": alerts,
                                        }),
                                        None,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    warn!(seller = %seller, error = %e, "expiration sweep failed")
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Routers: SSE streaming + queue admin + health/metrics.
    let sse_router = sse_routes::router(SseState {
        hub: hub.clone(),
        gate,
        queue: queue.clone(),
    });
    let api_router = api::router(ApiState {
        queue: queue.clone(),
        orchestrator: orchestrator.clone(),
        hub: hub.clone(),
    });

    let metrics_handle = prometheus.clone();
    let app = Router::new()
        .route("/health", get(api::health_check))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .merge(sse_router)
        .merge(api_router)
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("🛑 Shutdown signal received, draining workers");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Origin whitelist for the SSE endpoints: a closed set of host patterns from
/// the environment, never a wildcard in production.
fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .sse_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        warn!("⚠️  SSE_ALLOWED_ORIGINS empty or unparsable - falling back to permissive CORS");
        return CorsLayer::permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recoup_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
