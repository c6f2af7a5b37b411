//! Request orchestration
//!
//! [`Intake`] runs one request through transport decoding, media decoding,
//! canonicalization and inference, inside a capture span, and always
//! answers with a complete [`ResponseEnvelope`] (or a 400 when the endpoint
//! is configured to reject malformed input).
//!
//! Media decoding is CPU-bound and runs on the blocking pool; inference runs
//! in its own task. Both carry the request span and subscriber with them so
//! their log lines land in the request's capture.

use crate::audio::{self, CanonicalAudio, DecodedAudio};
use crate::capture::CaptureHub;
use crate::config::{InputErrorPolicy, SonicConfig, VisionConfig};
use crate::error::{ErrorKind, IntakeError, Result};
use crate::image::{self as vision, CanonicalImage, DecodedImage};
use crate::inference::Inference;
use crate::metrics::{Metrics, PhaseTimer};
use crate::transport;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, Instrument, Span};
use uuid::Uuid;

/// `Result` value of every failed request.
pub const FAILURE_SENTINEL: &str = "exception occur";

/// Body of every intake response, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "Result")]
    pub result: Value,
    pub logs: String,
    #[serde(rename = "TimeTaken")]
    pub time_taken: String,
}

impl ResponseEnvelope {
    pub fn success(result: Value, logs: String, elapsed: Duration) -> Self {
        Self {
            result,
            logs,
            time_taken: format_time_taken(elapsed),
        }
    }

    pub fn failure(logs: String, elapsed: Duration) -> Self {
        Self::success(Value::String(FAILURE_SENTINEL.to_string()), logs, elapsed)
    }

    pub fn is_failure(&self) -> bool {
        self.result.as_str() == Some(FAILURE_SENTINEL)
    }
}

/// `1.2345s` renders as `1.23秒`.
pub fn format_time_taken(elapsed: Duration) -> String {
    format!("{:.2}秒", elapsed.as_secs_f64())
}

/// What the HTTP layer sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Envelope(ResponseEnvelope),
    Rejected { detail: String },
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Envelope(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
            Outcome::Rejected { detail } => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
            }
        }
    }
}

/// Request lifecycle. `Failed` is reachable from any other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    TransportResolved,
    MediaDecoded,
    Canonicalized,
    Inferred,
    Responded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "START",
            Phase::TransportResolved => "TRANSPORT_RESOLVED",
            Phase::MediaDecoded => "MEDIA_DECODED",
            Phase::Canonicalized => "CANONICALIZED",
            Phase::Inferred => "INFERRED",
            Phase::Responded => "RESPONDED",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One media kind: how its bytes are decoded and canonicalized.
pub trait MediaKind: Clone + Send + Sync + 'static {
    type Decoded: Send + 'static;
    type Sample: Send + 'static;

    /// Short label used in spans and metrics.
    const NAME: &'static str;
    /// Liveness log line.
    const ALIVE: &'static str;
    /// Label of the decode+canonicalize timing line.
    const PREPARE_LABEL: &'static str;

    fn input_errors(&self) -> InputErrorPolicy;

    fn decode(&self, raw: &[u8]) -> Result<Self::Decoded>;

    fn canonicalize(&self, decoded: Self::Decoded) -> Result<Self::Sample>;

    fn describe(sample: &Self::Sample) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct Vision {
    pub config: VisionConfig,
}

impl MediaKind for Vision {
    type Decoded = DecodedImage;
    type Sample = CanonicalImage;

    const NAME: &'static str = "vision";
    const ALIVE: &'static str = "I am alive!!";
    const PREPARE_LABEL: &'static str = "Image decode";

    fn input_errors(&self) -> InputErrorPolicy {
        self.config.input_errors
    }

    fn decode(&self, raw: &[u8]) -> Result<DecodedImage> {
        vision::decode_image(raw, self.config.channel_order)
    }

    fn canonicalize(&self, decoded: DecodedImage) -> Result<CanonicalImage> {
        vision::canonicalize(decoded, &self.config)
    }

    fn describe(sample: &CanonicalImage) -> String {
        let (h, w, c) = sample.pixels.dim();
        format!(
            "shape: ({}, {}, {}) | order: {} | orientation: {}",
            h,
            w,
            c,
            sample.order.as_str(),
            sample.orientation
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sonic {
    pub config: SonicConfig,
}

impl MediaKind for Sonic {
    type Decoded = DecodedAudio;
    type Sample = CanonicalAudio;

    const NAME: &'static str = "sonic";
    const ALIVE: &'static str = "Audio API alive!!";
    const PREPARE_LABEL: &'static str = "Waveform decode";

    fn input_errors(&self) -> InputErrorPolicy {
        self.config.input_errors
    }

    fn decode(&self, raw: &[u8]) -> Result<DecodedAudio> {
        audio::decode_audio(raw)
    }

    fn canonicalize(&self, decoded: DecodedAudio) -> Result<CanonicalAudio> {
        audio::canonicalize(decoded, self.config.target_sample_rate)
    }

    fn describe(sample: &CanonicalAudio) -> String {
        format!(
            "LENGTH: {} samples | RATE: {} Hz",
            sample.samples.len(),
            sample.sample_rate
        )
    }
}

/// Orchestrator of one endpoint.
pub struct Intake<K: MediaKind> {
    kind: K,
    model: Arc<dyn Inference<K::Sample>>,
    hub: CaptureHub,
    metrics: Arc<Metrics>,
}

impl<K: MediaKind> Clone for Intake<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            model: Arc::clone(&self.model),
            hub: self.hub.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<K: MediaKind> Intake<K> {
    pub fn new(
        kind: K,
        model: Arc<dyn Inference<K::Sample>>,
        hub: CaptureHub,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            kind,
            model,
            hub,
            metrics,
        }
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Liveness answer; never touches the pipeline.
    pub fn alive(&self) -> Value {
        info!(kind = K::NAME, "{}", K::ALIVE);
        json!({ "status": "ok" })
    }

    /// Run one request end to end.
    ///
    /// The capture is detached on every path, including when this future is
    /// dropped before completion.
    pub async fn handle(&self, request: Request) -> Outcome {
        let request_id = Uuid::new_v4().to_string();
        let capture = self.hub.attach();
        let span = capture.span(K::NAME, &request_id);

        let mut timer = PhaseTimer::start();
        let result = self.run(request, &mut timer).instrument(span).await;

        let logs = capture.detach();
        let elapsed = timer.elapsed();
        self.metrics.record_request(
            K::NAME,
            result.as_ref().map(|_| ()).map_err(IntakeError::kind),
            elapsed.as_millis() as u64,
        );

        match result {
            Ok(value) => Outcome::Envelope(ResponseEnvelope::success(value, logs, elapsed)),
            Err(e)
                if e.kind() == ErrorKind::Input
                    && self.kind.input_errors() == InputErrorPolicy::BadRequest =>
            {
                Outcome::Rejected {
                    detail: e.message().to_string(),
                }
            }
            Err(_) => Outcome::Envelope(ResponseEnvelope::failure(logs, elapsed)),
        }
    }

    async fn run(&self, request: Request, timer: &mut PhaseTimer) -> Result<Value> {
        let mut phase = Phase::Start;
        info!(
            "=====START REQUEST: {} {}",
            request.method(),
            request.uri().path()
        );

        match self.pipeline(request, timer, &mut phase).await {
            Ok(value) => {
                info!("=====END");
                Ok(value)
            }
            Err(e) => {
                error!(
                    phase = %phase,
                    kind = e.kind().as_str(),
                    "Unhandled error: {}",
                    e
                );
                info!("=====END ({})", Phase::Failed);
                Err(e)
            }
        }
    }

    async fn pipeline(
        &self,
        request: Request,
        timer: &mut PhaseTimer,
        phase: &mut Phase,
    ) -> Result<Value> {
        let raw = transport::extract(request).await?;
        *phase = Phase::TransportResolved;

        if let Some(guid) = raw.guid.as_deref() {
            Span::current().record("guid", guid);
            info!("GUID: {}", guid);
        }
        info!(
            "    INPUT TYPE: {} | ORIGIN SIZE: {} bytes | FORMAT: {}",
            raw.mode,
            raw.len(),
            raw.sniff_mime().unwrap_or("unknown")
        );

        let kind = self.kind.clone();
        let decoded = run_blocking({
            let kind = kind.clone();
            move || kind.decode(&raw.bytes)
        })
        .await?;
        *phase = Phase::MediaDecoded;

        let sample = run_blocking(move || kind.canonicalize(decoded)).await?;
        *phase = Phase::Canonicalized;
        timer.mark_prepared();
        info!("    {}", K::describe(&sample));

        info!("    Start inference");
        let result = self.infer(sample).await?;
        *phase = Phase::Inferred;
        timer.mark_inferred();

        info!(
            "    {} time: {:.2}sec",
            K::PREPARE_LABEL,
            secs(timer.prepare())
        );
        info!("    Model inference time: {:.2}sec", secs(timer.inference()));
        info!("    Total time: {:.2}sec", timer.elapsed().as_secs_f64());

        *phase = Phase::Responded;
        Ok(result)
    }

    async fn infer(&self, sample: K::Sample) -> Result<Value> {
        let model = Arc::clone(&self.model);
        let task = async move { model.infer(sample).await }
            .instrument(Span::current())
            .with_current_subscriber();

        match tokio::spawn(task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(IntakeError::Inference(msg))) => Err(IntakeError::Inference(msg)),
            Ok(Err(other)) => Err(IntakeError::Inference(other.to_string())),
            Err(e) => Err(join_fault(e)),
        }
    }
}

fn secs(d: Option<Duration>) -> f64 {
    d.map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Run CPU-bound work on the blocking pool, inside the current span and
/// subscriber.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());

    tokio::task::spawn_blocking(move || {
        tracing::dispatcher::with_default(&dispatch, || span.in_scope(f))
    })
    .await
    .map_err(join_fault)?
}

fn join_fault(e: JoinError) -> IntakeError {
    if e.is_panic() {
        IntakeError::Unexpected(format!("panic: {}", panic_message(e.into_panic())))
    } else {
        IntakeError::Unexpected("task cancelled".to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::inference::ShapeProbe;
    use async_trait::async_trait;
    use axum::body::Body;
    use tracing_subscriber::layer::SubscriberExt;

    struct Exploding;

    #[async_trait]
    impl Inference<CanonicalImage> for Exploding {
        async fn infer(&self, _sample: CanonicalImage) -> Result<Value> {
            panic!("model blew up");
        }
    }

    fn png_1x1() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn stream_request(bytes: &[u8]) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/vision_entrance")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "file_stream": bytes }).to_string()))
            .unwrap()
    }

    fn vision_intake(
        hub: &CaptureHub,
        model: Arc<dyn Inference<CanonicalImage>>,
    ) -> Intake<Vision> {
        Intake::new(Vision::default(), model, hub.clone(), Metrics::new())
    }

    fn hub() -> CaptureHub {
        CaptureHub::new(&CaptureConfig::default())
    }

    #[test]
    fn test_time_taken_format() {
        assert_eq!(format_time_taken(Duration::from_millis(1234)), "1.23秒");
        assert_eq!(format_time_taken(Duration::ZERO), "0.00秒");
    }

    #[test]
    fn test_envelope_wire_names() {
        let envelope = ResponseEnvelope::failure("x\n".to_string(), Duration::from_millis(50));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["Result"], FAILURE_SENTINEL);
        assert_eq!(value["logs"], "x\n");
        assert_eq!(value["TimeTaken"], "0.05秒");
        assert!(envelope.is_failure());
    }

    #[tokio::test]
    async fn test_successful_request_captures_logs() {
        let hub = hub();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(hub.layer()));
        let intake = vision_intake(&hub, Arc::new(ShapeProbe));

        let Outcome::Envelope(envelope) = intake.handle(stream_request(&png_1x1())).await else {
            panic!("expected an envelope");
        };

        assert!(!envelope.is_failure());
        assert_eq!(envelope.result["channels"], 3);
        assert!(envelope.logs.contains("=====START REQUEST: POST /vision_entrance"));
        assert!(envelope.logs.contains("INPUT TYPE: file_stream"));
        assert!(envelope.logs.contains("FORMAT: image/png"));
        assert!(envelope.logs.contains("Start inference"));
        assert!(envelope.logs.contains("Image decode time"));
        assert_eq!(hub.attached(), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_is_enveloped() {
        let hub = hub();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(hub.layer()));
        let metrics = Metrics::new();
        let intake = Intake::new(
            Vision::default(),
            Arc::new(ShapeProbe),
            hub.clone(),
            Arc::clone(&metrics),
        );

        let Outcome::Envelope(envelope) = intake.handle(stream_request(b"not an image")).await
        else {
            panic!("expected an envelope");
        };

        assert!(envelope.is_failure());
        assert!(envelope.logs.contains("Unhandled error"));
        assert!(envelope.logs.contains("phase=TRANSPORT_RESOLVED"));
        assert_eq!(metrics.snapshot().errors.decode, 1);
        assert_eq!(hub.attached(), 0);
    }

    #[tokio::test]
    async fn test_panicking_model_is_unexpected() {
        let hub = hub();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(hub.layer()));
        let metrics = Metrics::new();
        let intake = Intake::new(
            Vision::default(),
            Arc::new(Exploding),
            hub.clone(),
            Arc::clone(&metrics),
        );

        let Outcome::Envelope(envelope) = intake.handle(stream_request(&png_1x1())).await else {
            panic!("expected an envelope");
        };

        assert!(envelope.is_failure());
        assert!(envelope.logs.contains("model blew up"));
        assert_eq!(metrics.snapshot().errors.unexpected, 1);
    }

    #[tokio::test]
    async fn test_bad_request_policy_rejects_input_errors_only() {
        let hub = hub();
        let mut kind = Vision::default();
        kind.config.input_errors = InputErrorPolicy::BadRequest;
        let intake = Intake::new(kind, Arc::new(ShapeProbe), hub.clone(), Metrics::new());

        let outcome = intake.handle(stream_request(&[])).await;
        assert!(matches!(outcome, Outcome::Rejected { ref detail } if detail.starts_with("no valid input")));

        // Decode faults still use the envelope
        let outcome = intake.handle(stream_request(b"garbage")).await;
        assert!(matches!(outcome, Outcome::Envelope(ref e) if e.is_failure()));
        assert_eq!(hub.attached(), 0);
    }

    #[tokio::test]
    async fn test_run_blocking_maps_panics() {
        let err = run_blocking::<(), _>(|| panic!("boom")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(err.message().contains("boom"));
    }
}
