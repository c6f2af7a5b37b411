//! Per-request log capture
//!
//! A [`CaptureHub`] owns the buffers of every request currently in flight
//! and hands out a [`CaptureLayer`] that is installed once in the process
//! subscriber. A request calls [`CaptureHub::attach`], runs inside the span
//! returned by [`CaptureHandle::span`], and calls [`CaptureHub::detach`] to
//! collect its text.
//!
//! Routing depends on [`CapturePolicy`]:
//!
//! - `Isolated`: an event lands in a buffer only when the capture span of
//!   that buffer is in the event's span scope. Concurrent requests never see
//!   each other's lines.
//! - `Shared`: every observed event is appended to every attached buffer,
//!   so a request also collects lines from requests that overlap with it.

use crate::config::{CaptureConfig, CapturePolicy};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Span, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Span field carrying the capture id.
pub const CAPTURE_FIELD: &str = "capture_id";

/// Timestamp layout of a captured line.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

#[derive(Clone)]
pub struct CaptureHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    policy: CapturePolicy,
    targets: Vec<String>,
    next_id: AtomicU64,
    buffers: Mutex<HashMap<u64, String>>,
}

impl CaptureHub {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                policy: config.policy,
                targets: config.targets.clone(),
                next_id: AtomicU64::new(1),
                buffers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> CapturePolicy {
        self.inner.policy
    }

    /// Layer to install in the process subscriber.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer { hub: self.clone() }
    }

    /// Register a fresh, empty buffer.
    pub fn attach(&self) -> CaptureHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers().insert(id, String::new());
        CaptureHandle {
            id,
            hub: self.clone(),
            detached: false,
        }
    }

    /// Remove the registration made by `attach` and return its text.
    pub fn detach(&self, handle: CaptureHandle) -> String {
        handle.detach()
    }

    /// Number of captures currently attached.
    pub fn attached(&self) -> usize {
        self.buffers().len()
    }

    fn take(&self, id: u64) -> Option<String> {
        self.buffers().remove(&id)
    }

    fn observes(&self, target: &str) -> bool {
        self.inner
            .targets
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()))
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<u64, String>> {
        // A poisoned map still holds valid text; keep serving it.
        self.inner
            .buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registration token of one attached capture.
///
/// Dropping a handle without detaching it (e.g. a cancelled request)
/// still removes the registration.
pub struct CaptureHandle {
    id: u64,
    hub: CaptureHub,
    detached: bool,
}

impl CaptureHandle {
    /// Span that scopes events to this capture.
    pub fn span(&self, kind: &'static str, request_id: &str) -> Span {
        tracing::info_span!(
            "request",
            capture_id = self.id,
            kind,
            request_id,
            guid = tracing::field::Empty,
        )
    }

    pub fn detach(mut self) -> String {
        self.detached = true;
        self.hub.take(self.id).unwrap_or_default()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.hub.take(self.id);
        }
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle").field("id", &self.id).finish()
    }
}

/// Marker stored in the extensions of a capture span.
struct CaptureTag(u64);

pub struct CaptureLayer {
    hub: CaptureHub,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = CaptureIdVisitor(None);
        attrs.record(&mut visitor);
        if let (Some(capture_id), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(CaptureTag(capture_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self.hub.observes(metadata.target()) {
            return;
        }

        match self.hub.policy() {
            CapturePolicy::Isolated => {
                let Some(capture_id) = ctx.event_scope(event).and_then(|mut scope| {
                    scope.find_map(|span| {
                        let extensions = span.extensions();
                        extensions.get::<CaptureTag>().map(|tag| tag.0)
                    })
                }) else {
                    return;
                };

                let line = format_line(event);
                if let Some(buf) = self.hub.buffers().get_mut(&capture_id) {
                    buf.push_str(&line);
                }
            }
            CapturePolicy::Shared => {
                let mut buffers = self.hub.buffers();
                if buffers.is_empty() {
                    return;
                }
                let line = format_line(event);
                for buf in buffers.values_mut() {
                    buf.push_str(&line);
                }
            }
        }
    }
}

/// Level label of a captured line; `WARN` is spelled out as `WARNING`.
fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        _ => "TRACE",
    }
}

/// `2025-01-01 12:00:00,123 [INFO] target: message key=value`
fn format_line(event: &Event<'_>) -> String {
    let metadata = event.metadata();
    let mut visitor = LineVisitor::default();
    event.record(&mut visitor);

    let mut line = format!(
        "{} [{}] {}: {}",
        chrono::Local::now().format(TIME_FORMAT),
        level_label(metadata.level()),
        metadata.target(),
        visitor.message
    );
    line.push_str(&visitor.fields);
    line.push('\n');
    line
}

struct CaptureIdVisitor(Option<u64>);

impl Visit for CaptureIdVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == CAPTURE_FIELD {
            self.0 = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
