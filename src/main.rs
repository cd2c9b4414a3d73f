use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;

use inbox_triage::api::api_routes;
use inbox_triage::config::{ClassifierConfig, ServerConfig};
use inbox_triage::llm::{LlmConfig, create_provider};
use inbox_triage::pipeline::ClassificationOrchestrator;
use inbox_triage::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env().context("loading server configuration")?;
    let classifier = ClassifierConfig::from_env();

    eprintln!("📬 Inbox Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", server.openai_model);
    eprintln!("   Database: {}", server.db_path);
    eprintln!("   API: http://0.0.0.0:{}/api", server.port);
    eprintln!(
        "   Batches: {} threads, {} concurrent, {:?} run timeout\n",
        classifier.batch_size, classifier.max_concurrent_llm_calls, classifier.run_timeout
    );

    // ── LLM ──────────────────────────────────────────────────────────────
    let llm = create_provider(&LlmConfig {
        api_key: server.openai_api_key.clone(),
        model: server.openai_model.clone(),
        base_url: server.openai_base_url.clone(),
        request_timeout: server.llm_timeout,
    })
    .context("creating LLM provider")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&server.db_path))
            .await
            .with_context(|| format!("opening database at {}", server.db_path))?,
    );

    // ── Server ───────────────────────────────────────────────────────────
    let orchestrator = Arc::new(ClassificationOrchestrator::new(
        Arc::clone(&db),
        llm,
        classifier,
    ));
    let app = api_routes(db, orchestrator).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server.port))
        .await
        .with_context(|| format!("binding port {}", server.port))?;
    tracing::info!(port = server.port, "Inbox triage server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("serving HTTP")?;

    Ok(())
}
