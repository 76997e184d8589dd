//! HTTP JSON feed adapter.
//!
//! GETs a JSON document and reads an array of row objects from it, either
//! the document itself or the value at `rows_pointer` (RFC 6901 pointer).
//!
//! Feed URLs go through a [`FeedUrlPolicy`] before every fetch. Redirects
//! are not followed.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::net::IpAddr;
use tracing::{debug, warn};
use url::{Host, Url};

use super::inline::{default_external_id_field, default_record_type_field};
use super::{
    parse_config, parse_config_value, row_from_json, NormalizedRow, Normalizer, NormalizerError,
    ObjectRowFields,
};
use crate::models::DirectorySource;
use crate::types::RecordType;

/// `config` of an `http_json` source.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpJsonSourceConfig {
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// JSON pointer to the rows array, e.g. `/data/users`.
    #[serde(default)]
    pub rows_pointer: Option<String>,
    #[serde(default = "default_external_id_field")]
    pub external_id_field: String,
    #[serde(default = "default_record_type_field")]
    pub record_type_field: String,
    #[serde(default)]
    pub record_type: Option<RecordType>,
}

/// Hostnames that always point at the local machine or cloud metadata.
const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "metadata.goog",
];

/// Which feed URLs the HTTP adapter may fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedUrlPolicy {
    /// When non-empty, the only hosts feeds may point at. Listed hosts are
    /// trusted even when they resolve to private addresses.
    pub allowed_hosts: Vec<String>,
    /// Permit loopback, private and link-local targets.
    pub allow_private_networks: bool,
}

impl FeedUrlPolicy {
    /// Any host, private networks included.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            allow_private_networks: true,
        }
    }

    /// Checks that need no DNS: scheme, allow-list, literal addresses and
    /// well-known internal names.
    pub fn check_url(&self, raw: &str) -> Result<Url, NormalizerError> {
        let url = Url::parse(raw)
            .map_err(|e| NormalizerError::InvalidConfig(format!("Invalid feed URL: {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(NormalizerError::InvalidConfig(format!(
                    "URL scheme '{scheme}' not allowed; only HTTP(S) permitted"
                )))
            }
        }
        let host = url
            .host()
            .ok_or_else(|| NormalizerError::InvalidConfig("Feed URL must have a host".to_string()))?;

        if !self.allowed_hosts.is_empty() {
            let name = host_name(&host);
            if self.allowed_hosts.iter().any(|allowed| *allowed == name) {
                return Ok(url);
            }
            return Err(NormalizerError::InvalidConfig(format!(
                "Feed host '{name}' is not in the allowed host list"
            )));
        }
        if self.allow_private_networks {
            return Ok(url);
        }

        let blocked = match &host {
            Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(*ip)),
            Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(*ip)),
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_lowercase();
                BLOCKED_HOSTS
                    .iter()
                    .any(|h| domain == *h || domain.ends_with(&format!(".{h}")))
            }
        };
        if blocked {
            return Err(NormalizerError::InvalidConfig(format!(
                "Feed host '{}' is not allowed (internal/private address)",
                host_name(&host)
            )));
        }
        Ok(url)
    }

    /// Full check before a fetch: [`Self::check_url`], then every address
    /// the host resolves to must be public.
    pub async fn check_fetch(&self, raw: &str) -> Result<Url, NormalizerError> {
        let url = self.check_url(raw)?;
        if self.allow_private_networks || !self.allowed_hosts.is_empty() {
            return Ok(url);
        }
        let Some(Host::Domain(domain)) = url.host() else {
            return Ok(url);
        };
        let domain = domain.to_string();

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs: Vec<_> = tokio::net::lookup_host((domain.as_str(), port))
            .await
            .map_err(|e| {
                NormalizerError::Unreachable(format!("DNS resolution failed for '{domain}': {e}"))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(NormalizerError::Unreachable(format!(
                "DNS resolution returned no addresses for '{domain}'"
            )));
        }
        if let Some(addr) = addrs.iter().find(|addr| is_private_ip(&addr.ip())) {
            return Err(NormalizerError::InvalidConfig(format!(
                "Feed host '{domain}' resolves to private IP {}",
                addr.ip()
            )));
        }
        Ok(url)
    }
}

fn host_name(host: &Host<&str>) -> String {
    match host {
        Host::Domain(domain) => domain.trim_end_matches('.').to_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}

/// Loopback, private, link-local, CGNAT and unspecified addresses.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Adapter for `source_type = "http_json"`.
#[derive(Debug, Clone)]
pub struct HttpJsonNormalizer {
    http_client: Client,
    policy: FeedUrlPolicy,
}

impl HttpJsonNormalizer {
    /// Adapter that refuses private targets and does not follow redirects.
    #[must_use]
    pub fn new() -> Self {
        let http_client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self::with_client(http_client)
    }

    /// Use a preconfigured client (proxies, TLS roots). The client's
    /// redirect policy is the caller's responsibility.
    #[must_use]
    pub fn with_client(http_client: Client) -> Self {
        Self {
            http_client,
            policy: FeedUrlPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FeedUrlPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for HttpJsonNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Normalizer for HttpJsonNormalizer {
    fn source_type(&self) -> &str {
        "http_json"
    }

    fn check_config(&self, config: &JsonValue) -> Result<(), NormalizerError> {
        let config: HttpJsonSourceConfig = parse_config_value(config)?;
        self.policy.check_url(&config.url).map(|_| ())
    }

    async fn normalize(
        &self,
        source: &DirectorySource,
    ) -> Result<Vec<NormalizedRow>, NormalizerError> {
        let config: HttpJsonSourceConfig = parse_config(source)?;
        let url = self.policy.check_fetch(&config.url).await?;

        let mut request = self
            .http_client
            .get(url)
            .header("Accept", "application/json")
            .header("User-Agent", "xavyo-directory-sync");
        if let Some(token) = &config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NormalizerError::Unreachable(format!("GET {} failed: {e}", config.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                source_id = %source.id,
                status = %status,
                body_len = body.len(),
                "Directory feed returned an error status"
            );
            return Err(NormalizerError::Unreachable(format!(
                "GET {} returned {status}",
                config.url
            )));
        }

        let document: JsonValue = response
            .json()
            .await
            .map_err(|e| NormalizerError::Malformed(format!("Response is not JSON: {e}")))?;

        let rows = match &config.rows_pointer {
            Some(pointer) => document.pointer(pointer).ok_or_else(|| {
                NormalizerError::Malformed(format!("Nothing found at rows pointer '{pointer}'"))
            })?,
            None => &document,
        };
        let rows = rows
            .as_array()
            .ok_or_else(|| NormalizerError::Malformed("Rows value is not an array".to_string()))?;

        debug!(source_id = %source.id, rows = rows.len(), "Fetched directory feed");

        let names = ObjectRowFields {
            external_id_field: &config.external_id_field,
            record_type_field: &config.record_type_field,
            default_record_type: config
                .record_type
                .unwrap_or_else(|| source.default_record_type()),
        };
        Ok(rows
            .iter()
            .enumerate()
            .map(|(row_index, value)| row_from_json(row_index, value, &names))
            .collect())
    }
}
