//! Platform configuration model and file loading.
//!
//! Configuration is deserialized from YAML, TOML or JSON (auto-detected from
//! the file extension) with `${VAR}` environment substitution applied to the
//! raw text before parsing. [`PlatformConfig::validate`] runs every
//! structural check once at startup; anything it rejects is fatal.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error. Always fatal at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ─────────────────────────────────────────────────────────────────────────────
// Gateway configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Wire protocol spoken by a backend target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetProtocol {
    Http1,
    Http2,
    Grpc,
}

/// gRPC flavour accepted on a route's client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrpcProtocol {
    Grpc,
    GrpcWeb,
    GrpcWebsockets,
}

/// Backend target of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub protocol: TargetProtocol,
}

/// A single routing rule, matched in declared order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Stable name used in logs and metrics.
    pub name: String,
    /// Exact host match. Absent means any host.
    #[serde(default)]
    pub host: Option<String>,
    /// Path base, matched by longest prefix. Must begin with `/`.
    pub path_prefix: String,
    /// Accepted HTTP methods (uppercase). Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,
    pub target: TargetConfig,
    /// gRPC flavour this route accepts from clients.
    #[serde(default)]
    pub grpc_protocol: Option<GrpcProtocol>,
}

impl RouteConfig {
    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("route name cannot be empty".into()));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "route '{}': path prefix must start with '/'",
                self.name
            )));
        }
        for m in &self.methods {
            if http::Method::from_bytes(m.as_bytes()).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "route '{}': invalid HTTP method '{}'",
                    self.name, m
                )));
            }
        }
        if self.target.host.trim().is_empty() || self.target.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "route '{}': target host/port incomplete",
                self.name
            )));
        }
        Ok(())
    }
}

/// Redirect rule, checked before route matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Regex applied to the request path.
    pub source: String,
    pub target: String,
    pub status: u16,
}

/// Path rewrite applied to REST paths before matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub source: String,
    pub target: String,
}

/// An HTTP rule declared in configuration, equivalent to a `google.api.http`
/// method annotation. Used when descriptor sets do not carry the annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRuleConfig {
    /// Unqualified gRPC method name, e.g. `ReadObject`.
    pub method: String,
    /// HTTP verb (uppercase).
    pub http_method: String,
    /// Path template, e.g. `/metadata/{tenant}/objects/{objectId}`.
    pub path: String,
    /// Body selector: empty, `*`, or a field path.
    #[serde(default)]
    pub body: String,
    /// Response-body selector: empty, `*`, or a field path.
    #[serde(default)]
    pub response_body: String,
    /// Streamed raw-bytes download binding.
    #[serde(default)]
    pub download: bool,
}

/// REST binding discovery input: one gRPC service exposed through a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceApiConfig {
    /// Fully-qualified service name, e.g. `tracdap.api.TracMetadataApi`.
    pub service: String,
    /// File descriptor set (binary `FileDescriptorSet`) describing the service.
    pub descriptor_set: PathBuf,
    /// Name of the route carrying this service's calls.
    pub route: String,
    /// HTTP rules for methods whose descriptors carry no annotation.
    #[serde(default)]
    pub http_rules: Vec<HttpRuleConfig>,
}

/// Gateway listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_fault_log_bytes() -> usize {
    256
}

/// Gateway section of the platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    /// Idle timeout applied per connection after protocol negotiation.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Service name flagging bulk-data routes for enlarged HTTP/2 settings.
    #[serde(default)]
    pub data_api_name: String,
    /// Ordered route table. First match wins.
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub redirects: Vec<RedirectRule>,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
    #[serde(default)]
    pub services: Vec<ServiceApiConfig>,
    /// Cap on bytes-at-fault logged for malformed frames.
    #[serde(default = "default_fault_log_bytes")]
    pub fault_log_bytes: usize,
}

impl GatewayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.idle_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("at least one route is required".into()));
        }
        for route in &self.routes {
            route.validate()?;
        }
        let mut names: Vec<&str> = self.routes.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.routes.len() {
            return Err(ConfigError::Invalid("duplicate route name".into()));
        }
        for rule in &self.redirects {
            Regex::new(&rule.source).map_err(|e| {
                ConfigError::Invalid(format!("redirect '{}': bad regex: {}", rule.source, e))
            })?;
            if !(300..400).contains(&rule.status) {
                return Err(ConfigError::Invalid(format!(
                    "redirect '{}': status must be 3xx",
                    rule.source
                )));
            }
        }
        for rule in &self.rewrites {
            Regex::new(&rule.source).map_err(|e| {
                ConfigError::Invalid(format!("rewrite '{}': bad regex: {}", rule.source, e))
            })?;
        }
        for svc in &self.services {
            if !self.routes.iter().any(|r| r.name == svc.route) {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' references unknown route '{}'",
                    svc.service, svc.route
                )));
            }
        }
        Ok(())
    }

    /// True when a route carries the bulk data API and should run with
    /// enlarged HTTP/2 settings.
    pub fn is_data_route(&self, route: &RouteConfig) -> bool {
        !self.data_api_name.is_empty() && route.path_prefix.contains(&self.data_api_name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration configuration
// ─────────────────────────────────────────────────────────────────────────────

fn default_max_ticket_duration() -> u64 {
    300
}

/// Job-cache section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// sqlx connection string, e.g. `sqlite://trac_cache.db`.
    pub database_url: String,
    /// Policy ceiling on requested ticket durations.
    #[serde(default = "default_max_ticket_duration")]
    pub max_ticket_duration_seconds: u64,
}

/// Batch-executor section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Root directory for batch sandboxes. Absent means the OS temp dir.
    #[serde(default)]
    pub batch_root: Option<PathBuf>,
    /// Keep sandbox directories after destroy (for debugging).
    #[serde(default)]
    pub persist_sandboxes: bool,
    /// Environment variable names inherited from the executor process.
    #[serde(default)]
    pub inherited_env: Vec<String>,
    /// Extra environment applied to every batch.
    #[serde(default)]
    pub batch_env: BTreeMap<String, String>,
}

/// Orchestrator section of the platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchConfig {
    pub cache: CacheConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Root configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Root of the platform configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub orch: Option<OrchConfig>,
}

impl PlatformConfig {
    /// Run all structural checks. Anything rejected here is fatal at startup.
    pub fn validate(&self) -> ConfigResult<()> {
        self.gateway.validate()?;
        if let Some(orch) = &self.orch {
            if orch.cache.database_url.trim().is_empty() {
                return Err(ConfigError::Invalid("cache database_url cannot be empty".into()));
            }
            if orch.cache.max_ticket_duration_seconds == 0 {
                return Err(ConfigError::Invalid(
                    "max_ticket_duration_seconds must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File loading
// ─────────────────────────────────────────────────────────────────────────────

/// Detect configuration format from a file extension.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute `${VAR}` and `$VAR` environment references in raw config text.
/// Unset variables are left verbatim.
pub fn substitute_env_vars(content: &str) -> String {
    let re_braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let result = re_braced
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    let re_simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap();
    re_simple
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string()
}

/// Load a typed configuration from a file, with env substitution applied to
/// the raw text before parsing.
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let raw = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&raw);

    let cfg = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    cfg.try_deserialize().map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load a typed configuration with an environment-variable override layer
/// (`PREFIX__section__field` style, double-underscore separated).
pub fn load_with_env<T>(path: &str, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let raw = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&raw);

    let cfg = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .add_source(Environment::with_prefix(env_prefix).separator("__"))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    cfg.try_deserialize().map_err(|e| ConfigError::Parse(e.to_string()))
}
