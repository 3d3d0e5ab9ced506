//! HTTP client wrapper: connection pooling, dispatcher concurrency limits,
//! and the response-parsing helpers shared by the session store and the
//! journey executor.

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::connection_pool::PoolConfig;
use crate::errors::StepError;
use crate::metrics::{CONCURRENT_REQUESTS, REQUEST_DURATION_SECONDS, REQUEST_STATUS_CODES, REQUEST_TOTAL};
use crate::percentiles::GLOBAL_REQUEST_PERCENTILES;
use crate::utils::parse_headers_with_escapes;

/// Configuration for building the HTTP client.
pub struct ClientConfig {
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub custom_headers: Option<String>,
    pub pool_config: Option<PoolConfig>,
    pub request_timeout: std::time::Duration,
    pub max_concurrent_requests: usize,
    pub max_per_host: usize,
}

/// Result of building the client, includes parsed headers for logging.
pub struct ClientBuildResult {
    pub client: reqwest::Client,
    pub parsed_headers: HeaderMap,
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(
    config: &ClientConfig,
) -> Result<ClientBuildResult, Box<dyn std::error::Error + Send + Sync>> {
    let mut client_builder = reqwest::Client::builder().timeout(config.request_timeout);

    if let Some(ref resolve_str) = config.resolve_target_addr {
        if !resolve_str.is_empty() {
            client_builder = configure_dns_override(client_builder, resolve_str)?;
        } else {
            warn!("RESOLVE_TARGET_ADDR is set but empty, no DNS override will be applied.");
        }
    }

    client_builder = configure_mtls(
        client_builder,
        config.client_cert_path.as_deref(),
        config.client_key_path.as_deref(),
    )?;

    let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
    }

    let pool_config = config.pool_config.clone().unwrap_or_default();
    client_builder = pool_config.apply_to_builder(client_builder);

    let client = if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification.");
        client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?
    } else {
        client_builder.build()?
    };

    Ok(ClientBuildResult {
        client,
        parsed_headers,
    })
}

fn configure_dns_override(
    mut client_builder: reqwest::ClientBuilder,
    resolve_str: &str,
) -> Result<reqwest::ClientBuilder, Box<dyn std::error::Error + Send + Sync>> {
    let parts: Vec<&str> = resolve_str.split(':').collect();
    if parts.len() != 3 {
        return Err(format!(
            "RESOLVE_TARGET_ADDR ('{}') is not in the expected format 'hostname:ip:port'",
            resolve_str
        )
        .into());
    }

    let hostname_to_override = parts[0].trim();
    let ip_to_resolve_to = parts[1].trim();
    let port_to_connect_to_str = parts[2].trim();

    if hostname_to_override.is_empty() || ip_to_resolve_to.is_empty() || port_to_connect_to_str.is_empty() {
        return Err("RESOLVE_TARGET_ADDR: all three parts (hostname, ip, port) must be non-empty".into());
    }

    let port_to_connect_to: u16 = port_to_connect_to_str
        .parse()
        .map_err(|e| format!("Failed to parse port '{}': {}", port_to_connect_to_str, e))?;

    let socket_addr_str = format!("{}:{}", ip_to_resolve_to, port_to_connect_to);
    let socket_addr: SocketAddr = socket_addr_str
        .parse()
        .map_err(|e| format!("Failed to parse '{}' into SocketAddr: {}", socket_addr_str, e))?;

    client_builder = client_builder.resolve(hostname_to_override, socket_addr);

    Ok(client_builder)
}

fn configure_mtls(
    mut client_builder: reqwest::ClientBuilder,
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<reqwest::ClientBuilder, Box<dyn std::error::Error + Send + Sync>> {
    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut cert_file = File::open(cert_path)
                .map_err(|e| format!("Failed to open client certificate '{}': {}", cert_path, e))?;
            let mut cert_pem_buf = Vec::new();
            cert_file.read_to_end(&mut cert_pem_buf)?;

            let mut key_file = File::open(key_path)
                .map_err(|e| format!("Failed to open client key '{}': {}", key_path, e))?;
            let mut key_pem_buf = Vec::new();
            key_file.read_to_end(&mut key_pem_buf)?;

            let mut cert_pem_cursor = std::io::Cursor::new(cert_pem_buf.as_slice());
            let certs_result: Vec<_> = rustls_pemfile::certs(&mut cert_pem_cursor).collect();
            if certs_result.is_empty() {
                return Err(format!("No PEM certificates found in {}", cert_path).into());
            }

            let mut key_pem_cursor = std::io::Cursor::new(key_pem_buf.as_slice());
            let keys_result: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem_cursor).collect();
            if keys_result.is_empty() {
                return Err(format!("No PKCS#8 private key found in '{}'", key_path).into());
            }

            let mut combined_pem_buf = Vec::new();
            combined_pem_buf.extend_from_slice(&cert_pem_buf);
            if !cert_pem_buf.ends_with(b"\n") && !key_pem_buf.starts_with(b"\n") {
                combined_pem_buf.push(b'\n');
            }
            combined_pem_buf.extend_from_slice(&key_pem_buf);

            let identity = reqwest::Identity::from_pem(&combined_pem_buf)
                .map_err(|e| format!("Failed to build client identity: {}", e))?;

            client_builder = client_builder.identity(identity);
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err("mTLS configuration requires both client_cert_path and client_key_path".into());
        }
        (None, None) => {}
    }

    Ok(client_builder)
}

fn configure_custom_headers(
    custom_headers_str: Option<&str>,
) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair_str in parse_headers_with_escapes(headers_str) {
        let trimmed = header_pair_str.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parts: Vec<&str> = trimmed.splitn(2, ':').collect();
        if parts.len() != 2 {
            return Err(format!("Invalid header format in CUSTOM_HEADERS: '{}'", trimmed).into());
        }

        let name_str = parts[0].trim();
        let value_str = parts[1].trim().replace("\\,", ",");

        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| format!("Invalid header name '{}': {}", name_str, e))?;
        let header_value = HeaderValue::from_str(&value_str)
            .map_err(|e| format!("Invalid header value for '{}': {}", name_str, e))?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}

/// Dispatcher that caps global and per-host concurrency in front of the
/// shared [`reqwest::Client`]. The pool itself never drops a request;
/// excess callers simply queue on the semaphore.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    per_host: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, max_concurrent: usize, max_per_host: usize) -> Self {
        Self {
            client,
            global: Arc::new(Semaphore::new(max_concurrent.max(1))),
            per_host: Arc::new(Semaphore::new(max_per_host.max(1))),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Issue a request, completing exactly once on I/O completion. Draining
    /// the body here guarantees the underlying connection is released back
    /// to the pool regardless of the caller's interest in the payload.
    pub async fn fire(&self, request: reqwest::RequestBuilder) -> Result<FiredResponse, StepError> {
        let _global_permit = self.global.acquire().await.expect("semaphore not closed");
        let _host_permit = self.per_host.acquire().await.expect("semaphore not closed");

        CONCURRENT_REQUESTS.inc();
        let start = std::time::Instant::now();
        let result = request.send().await.map_err(|e| StepError::from_reqwest(&e));
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                CONCURRENT_REQUESTS.dec();
                REQUEST_TOTAL.inc();
                return Err(e);
            }
        };
        let status = response.status();
        let body_result = response.text().await.map_err(|e| StepError::from_reqwest(&e));
        let elapsed = start.elapsed();
        CONCURRENT_REQUESTS.dec();

        REQUEST_TOTAL.inc();
        REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());
        GLOBAL_REQUEST_PERCENTILES.record_ms(elapsed.as_millis() as u64);
        REQUEST_STATUS_CODES.with_label_values(&[status.as_u16().to_string().as_str()]).inc();

        let body = body_result?;

        if !status.is_success() {
            return Err(StepError::from_status(status.as_u16()));
        }

        Ok(FiredResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// A completed, fully-drained HTTP response.
pub struct FiredResponse {
    pub status: u16,
    pub body: String,
}

lazy_static::lazy_static! {
    static ref PARAMS_SCRIPT_RE: regex::Regex = regex::Regex::new(
        r#"(?is)<script\b(?:(?!type\s*=)[^>])*\btype\s*=\s*["']application/json["'][^>]*\bid\s*=\s*["']params["'][^>]*>(.*?)</script>|<script\b(?:(?!id\s*=)[^>])*\bid\s*=\s*["']params["'][^>]*\btype\s*=\s*["']application/json["'][^>]*>(.*?)</script>"#
    ).unwrap();
}

/// Locates and parses the embedded `<script id="params" type="application/json">`
/// block, attribute-order-insensitive, returning the enclosed JSON value.
pub fn extract_params_block(html: &str) -> Result<Value, StepError> {
    let captures = PARAMS_SCRIPT_RE
        .captures(html)
        .ok_or_else(|| StepError::Parse("missing params script".to_string()))?;

    let inner = captures
        .get(1)
        .or_else(|| captures.get(2))
        .ok_or_else(|| StepError::Parse("missing params script".to_string()))?
        .as_str();

    serde_json::from_str(inner).map_err(|e| StepError::Parse(format!("invalid params JSON: {}", e)))
}

/// Base64-decodes a named sub-field of a parsed params object and parses
/// the result as JSON.
pub fn decode_base64_json_field(params: &Value, field: &str) -> Result<Value, StepError> {
    let raw = params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StepError::Parse(format!("missing '{}' field", field)))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| StepError::Parse(format!("invalid base64 in '{}': {}", field, e)))?;

    serde_json::from_slice(&decoded)
        .map_err(|e| StepError::Parse(format!("invalid JSON inside decoded '{}': {}", field, e)))
}

/// Extracts `loadToken` from the `rawsps` sub-field, per the date-picker
/// response shape.
pub fn extract_load_token(html: &str) -> Result<String, StepError> {
    let params = extract_params_block(html)?;
    let rawsps = decode_base64_json_field(&params, "rawsps")?;
    rawsps
        .get("loadToken")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StepError::Parse("missing loadToken in rawsps".to_string()))
}

/// Extracts `playId` from the `rawp` sub-field, per the crossword response
/// shape. An absent field decodes to an empty string rather than an error.
pub fn extract_play_id(html: &str) -> Result<String, StepError> {
    let params = extract_params_block(html)?;
    let rawp = decode_base64_json_field(&params, "rawp")?;
    Ok(rawp
        .get("playId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn make_html(rawsps_json: &str, rawp_json: &str) -> String {
        let rawsps = base64::engine::general_purpose::STANDARD.encode(rawsps_json);
        let rawp = base64::engine::general_purpose::STANDARD.encode(rawp_json);
        format!(
            r#"<html><body><script id="params" type="application/json">{{"rawsps":"{}","rawp":"{}"}}</script></body></html>"#,
            rawsps, rawp
        )
    }

    #[test]
    fn extracts_load_token() {
        let html = make_html(r#"{"loadToken":"abc123"}"#, r#"{"playId":"play-1"}"#);
        assert_eq!(extract_load_token(&html).unwrap(), "abc123");
    }

    #[test]
    fn extracts_play_id() {
        let html = make_html(r#"{"loadToken":"abc123"}"#, r#"{"playId":"play-1"}"#);
        assert_eq!(extract_play_id(&html).unwrap(), "play-1");
    }

    #[test]
    fn attribute_order_insensitive() {
        let rawsps = base64::engine::general_purpose::STANDARD.encode(r#"{"loadToken":"xyz"}"#);
        let html = format!(
            r#"<script type="application/json" id="params">{{"rawsps":"{}","rawp":""}}</script>"#,
            rawsps
        );
        assert_eq!(extract_load_token(&html).unwrap(), "xyz");
    }

    #[test]
    fn missing_params_script_is_parse_error() {
        let html = "<html><body>nothing here</body></html>";
        assert!(matches!(extract_load_token(html), Err(StepError::Parse(_))));
    }

    #[test]
    fn absent_play_id_is_empty_string() {
        let html = make_html(r#"{"loadToken":"abc"}"#, r#"{}"#);
        assert_eq!(extract_play_id(&html).unwrap(), "");
    }
}
