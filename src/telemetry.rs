//! Structured logging init. Matches the teacher's
//! `tracing`/`tracing-subscriber` env-filter idiom from `main.rs`,
//! renamed for this binary's target.

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info".into()),
        )
        .with_target(false)
        .init();
}
