use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};

static MESSAGES_PERSISTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "messaging_service_messages_persisted_total",
        "Messages written to the message store",
    )
    .expect("failed to create messaging_service_messages_persisted_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register messaging_service_messages_persisted_total");
    counter
});

static PUBLISH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "messaging_service_publish_total",
            "Broker publish attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create messaging_service_publish_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register messaging_service_publish_total");
    counter
});

static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "messaging_service_deliveries_total",
            "Broker deliveries processed by listeners, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create messaging_service_deliveries_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register messaging_service_deliveries_total");
    counter
});

static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "messaging_service_notifications_total",
            "Live notifications by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create messaging_service_notifications_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register messaging_service_notifications_total");
    counter
});

/// What a listener did with one delivery
#[derive(Debug, Clone, Copy)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

impl DeliveryOutcome {
    fn as_label(self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::Requeued => "requeued",
            DeliveryOutcome::DeadLettered => "dead_lettered",
        }
    }
}

pub fn record_message_persisted() {
    MESSAGES_PERSISTED_TOTAL.inc();
}

pub fn record_publish(success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    PUBLISH_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_delivery(outcome: DeliveryOutcome) {
    DELIVERIES_TOTAL
        .with_label_values(&[outcome.as_label()])
        .inc();
}

pub fn record_notification(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "no_listener" };
    NOTIFICATIONS_TOTAL.with_label_values(&[outcome]).inc();
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
