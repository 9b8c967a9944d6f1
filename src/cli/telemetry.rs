//! Logging and span export for the gateway.
//!
//! Logs always go to stderr, pretty or as JSON lines. Spans are exported over
//! OTLP/gRPC only when an endpoint is configured through
//! `BAIDAOHUI_OTLP_ENDPOINT` or the standard `OTEL_EXPORTER_OTLP_ENDPOINT`.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64, Encoding};
use once_cell::sync::OnceCell;
use opentelemetry::{global, propagation::TextMapCompositePropagator, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
    Resource,
};
use std::{env, str::FromStr, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};
use ulid::Ulid;
use url::Url;

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// What `init` needs from the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub level: Option<Level>,
    pub format: LogFormat,
    pub deployment: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Pretty,
            deployment: "production".to_string(),
        }
    }
}

/// Where spans go. Gateway variables win over the generic `OTEL_*` ones.
#[derive(Debug)]
struct Export {
    endpoint: Url,
    metadata: MetadataMap,
    instance_id: String,
}

impl Export {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let first = |keys: [&str; 2]| keys.into_iter().find_map(&lookup);

        let Some(endpoint) = first(["BAIDAOHUI_OTLP_ENDPOINT", "OTEL_EXPORTER_OTLP_ENDPOINT"])
        else {
            return Ok(None);
        };
        if let Some(protocol) = lookup("OTEL_EXPORTER_OTLP_PROTOCOL") {
            if protocol != "grpc" {
                debug!(protocol, "Only OTLP over gRPC is exported, ignoring protocol");
            }
        }

        let metadata = match first(["BAIDAOHUI_OTLP_HEADERS", "OTEL_EXPORTER_OTLP_HEADERS"]) {
            Some(headers) => metadata_from_headers(&headers)?,
            None => MetadataMap::new(),
        };

        Ok(Some(Self {
            endpoint: endpoint_url(&endpoint)?,
            metadata,
            instance_id: lookup("OTEL_SERVICE_INSTANCE_ID")
                .unwrap_or_else(|| Ulid::new().to_string()),
        }))
    }
}

/// Collector URL. A bare `host:port` is taken as https.
fn endpoint_url(endpoint: &str) -> Result<Url> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let endpoint = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    };
    Url::parse(&endpoint).with_context(|| format!("invalid OTLP endpoint: {endpoint}"))
}

/// Parse `key=value,key-bin=base64` into gRPC metadata. Pairs without `=`
/// are skipped.
fn metadata_from_headers(headers: &str) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers.split(',').filter_map(|pair| pair.split_once('=')) {
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key.ends_with("-bin") {
            let bytes = Base64::decode_vec(value)
                .map_err(|err| anyhow!("OTLP header {key} is not base64: {err}"))?;
            let key = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid OTLP header name {key}: {err}"))?;
            metadata.insert_bin(key, MetadataValue::from_bytes(&bytes));
        } else {
            let parsed_key = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid OTLP header name {key}: {err}"))?;
            let value = value
                .parse()
                .map_err(|err| anyhow!("invalid OTLP header value for {key}: {err}"))?;
            metadata.insert(parsed_key, value);
        }
    }
    Ok(metadata)
}

fn resource(settings: &Settings, instance_id: String) -> Resource {
    Resource::builder_empty()
        .with_attributes(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance_id),
            KeyValue::new("deployment.environment", settings.deployment.clone()),
            KeyValue::new("vcs.revision", crate::GIT_COMMIT_HASH),
        ])
        .build()
}

fn init_tracer(export: Export, settings: &Settings) -> Result<Tracer> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(export.endpoint.as_str())
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);

    if export.endpoint.scheme() == "https" {
        if let Some(host) = export.endpoint.host_str() {
            let tls = ClientTlsConfig::new()
                .domain_name(host.to_string())
                .with_native_roots();
            builder = builder.with_tls_config(tls);
        }
    }
    if !export.metadata.is_empty() {
        builder = builder.with_metadata(export.metadata);
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(builder.build()?)
        .with_resource(resource(settings, export.instance_id))
        .build();

    if TRACER_PROVIDER.set(provider.clone()).is_err() {
        debug!("Tracer provider already installed");
    }
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(SERVICE_NAME))
}

/// `RUST_LOG` wins; otherwise the gateway logs at `level` and its
/// dependencies stay quiet.
fn filter(level: Option<Level>) -> Result<EnvFilter> {
    let level = level.unwrap_or(Level::ERROR);
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("h2=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("reqwest=warn".parse()?)
        // Statements already show up on the `db.query` spans.
        .add_directive("sqlx::query=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?))
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(false)
        .with_line_number(false)
        .with_target(false);
    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Install the global subscriber.
///
/// # Errors
/// Returns an error if the OTLP settings are invalid or a subscriber is
/// already installed.
pub fn init(settings: &Settings) -> Result<()> {
    let filter = filter(settings.level)?;
    let registry = Registry::default().with(fmt_layer(settings.format));

    match Export::from_lookup(|key| env::var(key).ok())? {
        Some(export) => {
            let endpoint = export.endpoint.to_string();
            let tracer = init_tracer(export, settings)?;
            let subscriber = registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
            debug!(endpoint, "Exporting spans");
        }
        None => tracing::subscriber::set_global_default(registry.with(filter))?,
    }

    Ok(())
}

/// Flush and stop the span exporter, if one was started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("Shutting down tracer provider");
        if let Err(err) = provider.shutdown() {
            debug!("Tracer provider shutdown failed: {err}");
        }
    }
}
