// Prometheus metrics definitions for the trivia backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Sessions currently accepting answers.
    pub static ref LIVE_SESSIONS: IntGauge =
        IntGauge::new("trivia_live_sessions", "Sessions currently live").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("trivia_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    pub static ref SESSIONS_LAUNCHED_TOTAL: IntCounter = IntCounter::new(
        "trivia_sessions_launched_total",
        "Sessions that went live",
    )
    .unwrap();

    pub static ref SESSIONS_COMPLETED_TOTAL: IntCounter = IntCounter::new(
        "trivia_sessions_completed_total",
        "Sessions that completed",
    )
    .unwrap();

    /// Join attempts, by outcome (joined, rejected).
    pub static ref JOINS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_joins_total", "Join attempts"),
        &["outcome"],
    )
    .unwrap();

    /// Answer submissions, by outcome (correct, incorrect, expired, duplicate, rejected).
    pub static ref ANSWERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_answers_total", "Answer submissions"),
        &["outcome"],
    )
    .unwrap();

    /// Territory claims, by outcome (claimed, already_claimed, rejected).
    pub static ref CLAIMS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_claims_total", "Territory claim attempts"),
        &["outcome"],
    )
    .unwrap();

    pub static ref ACHIEVEMENTS_UNLOCKED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_achievements_unlocked_total", "Achievements unlocked"),
        &["achievement"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("trivia_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    /// Total WebSocket messages sent to clients.
    pub static ref WEBSOCKET_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "trivia_websocket_messages_sent_total",
        "Total WebSocket messages sent",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time to resolve, store and publish one answer.
    pub static ref ANSWER_HANDLING_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("trivia_answer_handling_seconds", "Answer handling time in seconds")
            .buckets(vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "trivia_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(LIVE_SESSIONS.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(SESSIONS_LAUNCHED_TOTAL.clone()),
        Box::new(SESSIONS_COMPLETED_TOTAL.clone()),
        Box::new(JOINS_TOTAL.clone()),
        Box::new(ANSWERS_TOTAL.clone()),
        Box::new(CLAIMS_TOTAL.clone()),
        Box::new(ACHIEVEMENTS_UNLOCKED_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_SENT_TOTAL.clone()),
        Box::new(ANSWER_HANDLING_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        // Already-registered collectors are skipped.
        let _ = REGISTRY.register(c);
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: numeric segments become `:id`,
/// PINs become `:pin` and player tokens `:token`.
pub fn normalize_path(path: &str) -> String {
    let mut previous = "";
    path.split('/')
        .map(|segment| {
            let normalized = if segment.parse::<i64>().is_ok() {
                ":id"
            } else if previous == "play" || (previous == "sessions" && !segment.is_empty()) {
                ":pin"
            } else if previous == "players" && !segment.is_empty() {
                ":token"
            } else {
                segment
            };
            previous = segment;
            normalized
        })
        .collect::<Vec<_>>()
        .join("/")
}
