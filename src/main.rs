use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use frontdesk::config::AppConfig;
use frontdesk::db::{self, queries};
use frontdesk::handlers;
use frontdesk::services::ai::groq::GroqProvider;
use frontdesk::services::ai::ollama::OllamaProvider;
use frontdesk::services::ai::LlmProvider;
use frontdesk::services::conversation;
use frontdesk::services::generator;
use frontdesk::services::notify::twilio::TwilioSmsNotifier;
use frontdesk::services::sessions::{CallLocks, SqliteSessionStore};
use frontdesk::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let conn = db::init_db(&config.database_url)?;
    let db = Arc::new(Mutex::new(conn));

    let understanding: Box<dyn LlmProvider> = match config.llm_provider.as_str() {
        "groq" => {
            anyhow::ensure!(
                !config.groq_api_key.is_empty(),
                "GROQ_API_KEY must be set when LLM_PROVIDER=groq"
            );
            tracing::info!("using Groq LLM provider (model: {})", config.groq_model);
            Box::new(GroqProvider::new(
                config.groq_api_key.clone(),
                config.groq_model.clone(),
            ))
        }
        _ => {
            tracing::info!("using Ollama LLM provider (url: {})", config.ollama_url);
            Box::new(OllamaProvider::new(
                config.ollama_url.clone(),
                config.ollama_model.clone(),
            ))
        }
    };
    let notifier = TwilioSmsNotifier::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_phone_number.clone(),
    );

    let state = Arc::new(AppState {
        db: db.clone(),
        config: config.clone(),
        understanding,
        notifier: Box::new(notifier),
        sessions: Box::new(SqliteSessionStore::new(db)),
        call_locks: CallLocks::default(),
    });

    tokio::spawn(session_sweeper(state.clone()));
    tokio::spawn(horizon_sweeper(state.clone()));

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/webhook/voice", post(handlers::voice::voice_webhook))
        .route(
            "/webhook/voice/status",
            post(handlers::voice::voice_status),
        )
        .route(
            "/api/businesses/:id/availability",
            get(handlers::availability::get_availability),
        )
        .route(
            "/api/businesses/:id/slots/generate",
            post(handlers::maintenance::generate_slots),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Retire idle sessions and clear expired holds once a minute so a
/// dropped call never starves a slot for other callers.
async fn session_sweeper(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        if let Err(e) = conversation::expire_sessions(&state) {
            tracing::error!(error = %e, "session sweep failed");
        }
    }
}

/// Keep every business's slot inventory extended over the rolling horizon.
async fn horizon_sweeper(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
    loop {
        ticker.tick().await;

        let businesses = {
            let db = state.db.lock().unwrap();
            match queries::list_businesses(&db) {
                Ok(businesses) => businesses,
                Err(e) => {
                    tracing::error!(error = %e, "failed to list businesses for horizon sweep");
                    continue;
                }
            }
        };

        for business in businesses {
            let tz = match business.tz() {
                Ok(tz) => tz,
                Err(e) => {
                    tracing::error!(business_id = %business.id, error = %e, "bad timezone, skipping");
                    continue;
                }
            };
            let today = Utc::now().with_timezone(&tz).date_naive();

            let db = state.db.lock().unwrap();
            if let Err(e) = generator::generate(&db, &business, today, state.config.horizon_days) {
                tracing::error!(business_id = %business.id, error = %e, "horizon generation failed");
            }
        }
    }
}
