use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};

static LOGIN_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "auth_service_login_attempts_total",
            "Login attempts handled by auth-service, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create auth_service_login_attempts_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register auth_service_login_attempts_total");
    counter
});

static SESSIONS_REVOKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "auth_service_sessions_revoked_total",
        "Session records removed by logout",
    )
    .expect("failed to create auth_service_sessions_revoked_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register auth_service_sessions_revoked_total");
    counter
});

/// Outcome label values for login attempts
#[derive(Debug, Clone, Copy)]
pub enum LoginOutcome {
    Success,
    UnknownUser,
    BadPassword,
    PersistenceFailed,
}

impl LoginOutcome {
    fn as_label(self) -> &'static str {
        match self {
            LoginOutcome::Success => "success",
            LoginOutcome::UnknownUser => "unknown_user",
            LoginOutcome::BadPassword => "bad_password",
            LoginOutcome::PersistenceFailed => "persistence_failed",
        }
    }
}

pub fn record_login(outcome: LoginOutcome) {
    LOGIN_ATTEMPTS_TOTAL
        .with_label_values(&[outcome.as_label()])
        .inc();
}

pub fn record_session_revoked() {
    SESSIONS_REVOKED_TOTAL.inc();
}

/// Serialise the default registry in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
