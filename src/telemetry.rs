use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "questlink";

pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("questlink=info,info"));

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

/// Renders every event as a single `key=value` line.
pub struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    pub const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl Default for KeyValueFormatter {
    fn default() -> Self {
        Self::new()
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

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());

        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| {
            correlation_rank(lhs)
                .cmp(&correlation_rank(rhs))
                .then_with(|| lhs.cmp(rhs))
        });

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", metadata.target());
        push_field(&mut line, "pid", &pid);

        if let Some(span_path) = current_span_path(ctx) {
            push_field(&mut line, "span", &span_path);
        }

        push_field(&mut line, "msg", &message);

        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        if let Some(file) = metadata.file() {
            push_field(&mut line, "file", file);
        }
        if let Some(line_no) = metadata.line() {
            push_field(&mut line, "line", &line_no.to_string());
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

/// Correlation fields lead so lines for one request or endpoint line up.
const CORRELATION_FIELDS: [&str; 4] = ["event", "endpoint", "request_id", "operation_id"];

fn correlation_rank(key: &str) -> usize {
    CORRELATION_FIELDS
        .iter()
        .position(|field| *field == key)
        .unwrap_or(CORRELATION_FIELDS.len())
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

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            name => self.fields.push((name.to_string(), value)),
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

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.chars().any(|c| {
        c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
    });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

/// Process counters for the network layer. One instance per `NetworkAccess`,
/// shared by `Arc` with every component that records into it.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    requests: AtomicU64,
    retries: AtomicU64,
    endpoint_fallbacks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    operations_queued: AtomicU64,
    operations_replayed: AtomicU64,
    operations_rejected: AtomicU64,
    operations_abandoned: AtomicU64,
    channel_connects: AtomicU64,
    channel_reconnects: AtomicU64,
    channel_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeCountersSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub endpoint_fallbacks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub operations_queued: u64,
    pub operations_replayed: u64,
    pub operations_rejected: u64,
    pub operations_abandoned: u64,
    pub channel_connects: u64,
    pub channel_reconnects: u64,
    pub channel_failures: u64,
}

impl RuntimeCounters {
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_endpoint_fallbacks(&self) {
        self.endpoint_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_operations_queued(&self) {
        self.operations_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_operations_replayed(&self) {
        self.operations_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_operations_rejected(&self) {
        self.operations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_operations_abandoned(&self) {
        self.operations_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_channel_connects(&self) {
        self.channel_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_channel_reconnects(&self) {
        self.channel_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_channel_failures(&self) {
        self.channel_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            endpoint_fallbacks: self.endpoint_fallbacks.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            operations_queued: self.operations_queued.load(Ordering::Relaxed),
            operations_replayed: self.operations_replayed.load(Ordering::Relaxed),
            operations_rejected: self.operations_rejected.load(Ordering::Relaxed),
            operations_abandoned: self.operations_abandoned.load(Ordering::Relaxed),
            channel_connects: self.channel_connects.load(Ordering::Relaxed),
            channel_reconnects: self.channel_reconnects.load(Ordering::Relaxed),
            channel_failures: self.channel_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_values_with_spaces_and_quotes() {
        assert_eq!(encode_field_value("plain"), "plain");
        assert_eq!(encode_field_value("two words"), "\"two words\"");
        assert_eq!(encode_field_value("a\"b c"), "\"a\\\"b c\"");
    }

    #[test]
    fn counters_are_independent_per_instance() {
        let first = RuntimeCounters::default();
        let second = RuntimeCounters::default();
        first.inc_requests();
        first.record_cache_lookup(true);
        first.record_cache_lookup(false);
        assert_eq!(first.snapshot().requests, 1);
        assert_eq!(first.snapshot().cache_hits, 1);
        assert_eq!(first.snapshot().cache_misses, 1);
        assert_eq!(second.snapshot(), RuntimeCountersSnapshot::default());
    }
}
