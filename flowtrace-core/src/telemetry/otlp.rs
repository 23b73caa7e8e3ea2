//! OTLP (OpenTelemetry Protocol) export over HTTP.
//!
//! Converts span records to OTLP protobuf messages and POSTs them to
//! `<endpoint>/v1/traces`. Hooks run synchronously, so the client is the
//! blocking `reqwest` one.

use anyhow::Context;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource as OtlpResource;
use opentelemetry_proto::tonic::trace::v1::{
    span::SpanKind, status::StatusCode, ResourceSpans, ScopeSpans, Span, Status,
};
use prost::Message;
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::exporter::SpanExporter;
use super::span::{AttributeValue, Attributes, Resource, SpanRecord, SpanStatus};
use crate::config::TelemetryConfig;
use crate::error::{Result, TelemetryError};

const INSTRUMENTATION_SCOPE_NAME: &str = "flowtrace.telemetry";

/// Publishes spans to an OTLP/HTTP collector.
pub struct OtlpHttpExporter {
    url: String,
    headers: BTreeMap<String, String>,
    client: Client,
}

impl OtlpHttpExporter {
    pub fn new(endpoint: &str, headers: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Export(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: traces_url(endpoint),
            headers,
            client,
        })
    }

    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        Self::new(
            &config.endpoint,
            config.headers.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        debug!("Exporting OTLP traces to {}", self.url);

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/x-protobuf");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .body(payload)
            .send()
            .context("Failed to send OTLP export request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            warn!("OTLP export failed: {} - {}", status, body);
            anyhow::bail!("OTLP export failed with status {}", status);
        }

        debug!("OTLP export successful");
        Ok(())
    }
}

impl SpanExporter for OtlpHttpExporter {
    fn export(&self, resource: &Resource, batch: &[SpanRecord]) -> Result<()> {
        let payload = to_export_request(resource, batch).encode_to_vec();
        self.send(payload)
            .map_err(|e| TelemetryError::Export(format!("{e:#}")))
    }
}

fn traces_url(endpoint: &str) -> String {
    format!("{}/v1/traces", endpoint.trim_end_matches('/'))
}

/// Convert one batch to an OTLP `ExportTraceServiceRequest`.
pub fn to_export_request(resource: &Resource, batch: &[SpanRecord]) -> ExportTraceServiceRequest {
    let scope_spans = ScopeSpans {
        scope: Some(InstrumentationScope {
            name: INSTRUMENTATION_SCOPE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }),
        spans: batch.iter().map(to_otlp_span).collect(),
        ..Default::default()
    };

    let resource_spans = ResourceSpans {
        resource: Some(OtlpResource {
            attributes: to_key_values(&resource.attributes),
            ..Default::default()
        }),
        scope_spans: vec![scope_spans],
        ..Default::default()
    };

    ExportTraceServiceRequest {
        resource_spans: vec![resource_spans],
    }
}

fn to_otlp_span(span: &SpanRecord) -> Span {
    let code = match span.status {
        SpanStatus::Ok => StatusCode::Ok,
        SpanStatus::Error => StatusCode::Error,
    };

    Span {
        trace_id: span.trace_id.as_bytes().to_vec(),
        span_id: span.span_id.as_bytes().to_vec(),
        // root span has no parent
        parent_span_id: span
            .parent_span_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name.clone(),
        kind: SpanKind::Internal as i32,
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        attributes: to_key_values(&span.attributes),
        status: Some(Status {
            code: code as i32,
            message: String::new(),
        }),
        ..Default::default()
    }
}

fn to_key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| match value {
            AttributeValue::String(s) => kv_string(key, s),
            AttributeValue::Int(i) => kv_int(key, *i),
            AttributeValue::Bool(b) => kv_bool(key, *b),
        })
        .collect()
}

fn kv(key: &str, value: any_value::Value) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}

fn kv_string(key: &str, value: &str) -> KeyValue {
    kv(key, any_value::Value::StringValue(value.to_string()))
}

fn kv_bool(key: &str, value: bool) -> KeyValue {
    kv(key, any_value::Value::BoolValue(value))
}

fn kv_int(key: &str, value: i64) -> KeyValue {
    kv(key, any_value::Value::IntValue(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::span::{SpanId, TraceId};

    fn span(parent: Option<SpanId>, status: SpanStatus) -> SpanRecord {
        SpanRecord {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: parent,
            name: "Task: log".into(),
            start_time_unix_nano: 1_000,
            end_time_unix_nano: 2_000,
            status,
            attributes: Attributes::from([
                ("lineNum".to_string(), AttributeValue::Int(12)),
                ("filename".to_string(), AttributeValue::from("concord.yml")),
            ]),
        }
    }

    fn string_value(kv: &KeyValue) -> Option<&str> {
        match kv.value.as_ref()?.value.as_ref()? {
            any_value::Value::StringValue(s) => Some(s),
            _ => None,
        }
    }

    #[test]
    fn test_traces_url() {
        assert_eq!(traces_url("http://localhost:4318"), "http://localhost:4318/v1/traces");
        assert_eq!(traces_url("http://collector/otel/"), "http://collector/otel/v1/traces");
    }

    #[test]
    fn test_root_span_has_empty_parent() {
        let otlp = to_otlp_span(&span(None, SpanStatus::Ok));
        assert!(otlp.parent_span_id.is_empty());
        assert_eq!(otlp.trace_id.len(), 16);
        assert_eq!(otlp.span_id.len(), 8);
        assert_eq!(otlp.kind, SpanKind::Internal as i32);
        assert_eq!(otlp.status.unwrap().code, StatusCode::Ok as i32);
    }

    #[test]
    fn test_child_span_conversion() {
        let parent = SpanId::random();
        let record = span(Some(parent), SpanStatus::Error);
        let otlp = to_otlp_span(&record);

        assert_eq!(otlp.parent_span_id, parent.as_bytes().to_vec());
        assert_eq!(otlp.status.unwrap().code, StatusCode::Error as i32);
        assert_eq!(otlp.start_time_unix_nano, 1_000);
        assert_eq!(otlp.end_time_unix_nano, 2_000);

        let filename = otlp.attributes.iter().find(|kv| kv.key == "filename").unwrap();
        assert_eq!(string_value(filename), Some("concord.yml"));
        let line = otlp.attributes.iter().find(|kv| kv.key == "lineNum").unwrap();
        assert!(matches!(
            line.value.as_ref().unwrap().value,
            Some(any_value::Value::IntValue(12))
        ));
    }

    #[test]
    fn test_export_request_carries_resource_and_scope() {
        let resource = Resource::default().with_attribute("service.name", "flowtrace");
        let request = to_export_request(&resource, &[span(None, SpanStatus::Ok)]);

        assert_eq!(request.resource_spans.len(), 1);
        let resource_spans = &request.resource_spans[0];
        let attrs = &resource_spans.resource.as_ref().unwrap().attributes;
        assert_eq!(attrs[0].key, "service.name");
        assert_eq!(string_value(&attrs[0]), Some("flowtrace"));

        let scope_spans = &resource_spans.scope_spans[0];
        assert_eq!(scope_spans.scope.as_ref().unwrap().name, INSTRUMENTATION_SCOPE_NAME);
        assert_eq!(scope_spans.spans.len(), 1);

        // encodes without loss
        let bytes = request.encode_to_vec();
        let decoded = ExportTraceServiceRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_unreachable_collector_is_an_export_error() {
        let exporter = OtlpHttpExporter::new(
            "http://127.0.0.1:1",
            BTreeMap::new(),
            Duration::from_millis(200),
        )
        .unwrap();
        let err = exporter
            .export(&Resource::default(), &[span(None, SpanStatus::Ok)])
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Export(_)));
    }
}
