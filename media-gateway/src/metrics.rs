use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus registry for the four core components, registered the way
/// `integration-gateway/src/metrics.rs` registers its counters: one struct
/// owning the registry plus every metric handle, constructed once at boot.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    pub allocator_acquisitions_total: IntCounterVec,
    pub allocator_timeouts_total: IntCounterVec,
    pub allocator_wait_ms: Histogram,
    pub orchestrator_strategy_total: IntCounterVec,
    pub orchestrator_realtime_factor: Histogram,
    pub guardian_admission_total: IntCounterVec,
    pub guardian_in_flight: IntGauge,
    pub quota_reservations_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let allocator_acquisitions_total = IntCounterVec::new(
            Opts::new(
                "allocator_acquisitions_total",
                "Allocator lane acquisitions by model and outcome",
            ),
            &["model", "outcome"],
        )
        .expect("valid metric");

        let allocator_timeouts_total = IntCounterVec::new(
            Opts::new(
                "allocator_timeouts_total",
                "Allocator acquisitions that exhausted their wait budget",
            ),
            &["task"],
        )
        .expect("valid metric");

        let allocator_wait_ms = Histogram::with_opts(
            HistogramOpts::new(
                "allocator_wait_ms",
                "Milliseconds spent waiting for a lane to become ready",
            )
            .buckets(vec![0.0, 5.0, 25.0, 100.0, 500.0, 2000.0, 10000.0]),
        )
        .expect("valid metric");

        let orchestrator_strategy_total = IntCounterVec::new(
            Opts::new(
                "tts_orchestrator_strategy_total",
                "TTS orchestrator strategy selections",
            ),
            &["strategy"],
        )
        .expect("valid metric");

        let orchestrator_realtime_factor = Histogram::with_opts(
            HistogramOpts::new(
                "tts_orchestrator_realtime_factor",
                "audioDurationSec / processingSec for completed synthesis calls",
            )
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 150.0, 300.0, 600.0]),
        )
        .expect("valid metric");

        let guardian_admission_total = IntCounterVec::new(
            Opts::new(
                "guardian_admission_total",
                "Guardian admission decisions by outcome",
            ),
            &["outcome"],
        )
        .expect("valid metric");

        let guardian_in_flight = IntGauge::new(
            "guardian_in_flight_requests",
            "Requests currently admitted and in flight",
        )
        .expect("valid metric");

        let quota_reservations_total = IntCounterVec::new(
            Opts::new(
                "quota_reservations_total",
                "Quota reservation outcomes",
            ),
            &["outcome"],
        )
        .expect("valid metric");

        for collector in [
            Box::new(allocator_acquisitions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(allocator_timeouts_total.clone()),
            Box::new(allocator_wait_ms.clone()),
            Box::new(orchestrator_strategy_total.clone()),
            Box::new(orchestrator_realtime_factor.clone()),
            Box::new(guardian_admission_total.clone()),
            Box::new(guardian_in_flight.clone()),
            Box::new(quota_reservations_total.clone()),
        ] {
            let _ = registry.register(collector);
        }

        Self {
            registry,
            allocator_acquisitions_total,
            allocator_timeouts_total,
            allocator_wait_ms,
            orchestrator_strategy_total,
            orchestrator_realtime_factor,
            guardian_admission_total,
            guardian_in_flight,
            quota_reservations_total,
        }
    }

    pub fn render(&self) -> Response {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = String::new();
        if let Err(err) = encoder.encode_utf8(&families, &mut buf) {
            tracing::error!(error = %err, "failed to encode metrics");
        }
        ([(CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
