use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "switchyard";

pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("switchyard=info,info"));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new())
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let pid = std::process::id().to_string();
        let metadata = event.metadata();
        let component = metadata.target();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());

        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let span_path = current_span_path(ctx);

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", component);
        push_field(&mut line, "pid", &pid);

        if let Some(span_path) = span_path {
            push_field(&mut line, "span", &span_path);
        }

        push_field(&mut line, "msg", &message);

        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

fn current_span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    let span = ctx.lookup_current()?;
    let names: Vec<&str> = span.scope().from_root().map(|s| s.name()).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join("."))
    }
}

fn push_field(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');
    if value.chars().any(|ch| ch.is_whitespace() || ch == '"') {
        line.push('"');
        for ch in value.chars() {
            if ch == '"' {
                line.push('\\');
            }
            line.push(ch);
        }
        line.push('"');
    } else {
        line.push_str(value);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        if field.name().is_empty() {
            return;
        }
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

/// Process-wide counters for routing, transformation, delivery, and flow
/// activity. Everything is atomics or short critical sections; readers get
/// snapshots.
#[derive(Default)]
pub struct RuntimeCounters {
    deliveries_ok: AtomicU64,
    deliveries_failed: AtomicU64,
    dead_letters: AtomicU64,
    fatal_drops: AtomicU64,
    circuit_short_circuits: AtomicU64,
    flows_started: AtomicU64,
    flows_succeeded: AtomicU64,
    flows_failed: AtomicU64,
    flows_cancelled: AtomicU64,
    routes: RouteOutcomeRegistry,
    transformations: TransformationOutcomeRegistry,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub dead_letters: u64,
    pub fatal_drops: u64,
    pub circuit_short_circuits: u64,
    pub flows_started: u64,
    pub flows_succeeded: u64,
    pub flows_failed: u64,
    pub flows_cancelled: u64,
    pub routes: Vec<RouteOutcomeSnapshot>,
    pub transformations: Vec<TransformationOutcomeSnapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteOutcomeSnapshot {
    pub route: String,
    pub decisions: u64,
    pub no_match: u64,
    pub filtered: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformationOutcomeSnapshot {
    pub transformation: String,
    pub success: u64,
    pub failure: u64,
    pub duration_ms_total: u64,
}

#[derive(Default)]
struct RouteOutcomeRegistry {
    entries: Mutex<HashMap<String, RouteOutcome>>,
}

#[derive(Default)]
struct RouteOutcome {
    decisions: u64,
    no_match: u64,
    filtered: u64,
}

impl RouteOutcomeRegistry {
    fn record(&self, route: &str, apply: impl FnOnce(&mut RouteOutcome)) {
        let mut entries = self.entries.lock().expect("route outcome registry");
        apply(entries.entry(route.to_string()).or_default());
    }

    fn snapshot(&self) -> Vec<RouteOutcomeSnapshot> {
        let entries = self.entries.lock().expect("route outcome registry");
        let mut snapshot: Vec<RouteOutcomeSnapshot> = entries
            .iter()
            .map(|(route, outcome)| RouteOutcomeSnapshot {
                route: route.clone(),
                decisions: outcome.decisions,
                no_match: outcome.no_match,
                filtered: outcome.filtered,
            })
            .collect();
        snapshot.sort_by(|lhs, rhs| lhs.route.cmp(&rhs.route));
        snapshot
    }
}

#[derive(Default)]
struct TransformationOutcomeRegistry {
    entries: Mutex<HashMap<String, TransformationOutcome>>,
}

#[derive(Default)]
struct TransformationOutcome {
    success: u64,
    failure: u64,
    duration_ms_total: u64,
}

impl TransformationOutcomeRegistry {
    fn record(&self, transformation: &str, success: bool, duration: Duration) {
        let mut entries = self.entries.lock().expect("transformation registry");
        let entry = entries.entry(transformation.to_string()).or_default();
        if success {
            entry.success += 1;
        } else {
            entry.failure += 1;
        }
        entry.duration_ms_total += duration.as_millis() as u64;
    }

    fn snapshot(&self) -> Vec<TransformationOutcomeSnapshot> {
        let entries = self.entries.lock().expect("transformation registry");
        let mut snapshot: Vec<TransformationOutcomeSnapshot> = entries
            .iter()
            .map(|(transformation, outcome)| TransformationOutcomeSnapshot {
                transformation: transformation.clone(),
                success: outcome.success,
                failure: outcome.failure,
                duration_ms_total: outcome.duration_ms_total,
            })
            .collect();
        snapshot.sort_by(|lhs, rhs| lhs.transformation.cmp(&rhs.transformation));
        snapshot
    }
}

impl RuntimeCounters {
    pub fn inc_delivery_success(&self) {
        self.deliveries_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivery_failure(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fatal_drop(&self) {
        self.fatal_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_short_circuit(&self) {
        self.circuit_short_circuits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flow_started(&self) {
        self.flows_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flow_succeeded(&self) {
        self.flows_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flow_failed(&self) {
        self.flows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flow_cancelled(&self) {
        self.flows_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_decision(&self, route: &str) {
        self.routes.record(route, |outcome| outcome.decisions += 1);
    }

    pub fn record_route_no_match(&self, route: &str) {
        self.routes.record(route, |outcome| outcome.no_match += 1);
    }

    pub fn record_route_filtered(&self, route: &str) {
        self.routes.record(route, |outcome| outcome.filtered += 1);
    }

    pub fn record_transformation(&self, transformation: &str, success: bool, duration: Duration) {
        self.transformations.record(transformation, success, duration);
    }

    pub fn route_snapshot(&self, route: &str) -> RouteOutcomeSnapshot {
        self.routes
            .snapshot()
            .into_iter()
            .find(|entry| entry.route == route)
            .unwrap_or_else(|| RouteOutcomeSnapshot {
                route: route.to_string(),
                ..RouteOutcomeSnapshot::default()
            })
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            deliveries_ok: self.deliveries_ok.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            fatal_drops: self.fatal_drops.load(Ordering::Relaxed),
            circuit_short_circuits: self.circuit_short_circuits.load(Ordering::Relaxed),
            flows_started: self.flows_started.load(Ordering::Relaxed),
            flows_succeeded: self.flows_succeeded.load(Ordering::Relaxed),
            flows_failed: self.flows_failed.load(Ordering::Relaxed),
            flows_cancelled: self.flows_cancelled.load(Ordering::Relaxed),
            routes: self.routes.snapshot(),
            transformations: self.transformations.snapshot(),
        }
    }
}

/// Returns the process-wide counter set.
pub fn runtime_counters() -> &'static RuntimeCounters {
    static INSTANCE: OnceLock<RuntimeCounters> = OnceLock::new();
    INSTANCE.get_or_init(RuntimeCounters::default)
}
