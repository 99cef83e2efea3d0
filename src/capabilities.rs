use std::collections::HashSet;
use std::time::Duration;

use regex::RegexBuilder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::PackError;

pub const WFS_VERSION: &str = "1.0.0";
pub const WCS_VERSION: &str = "2.0.1";

/// Read-only view of the server's published catalog. Discovery failures are
/// fatal to a run: an incomplete catalog would silently produce an incomplete
/// plan.
pub trait CatalogClient: Send + Sync {
    fn feature_type_names(&self) -> Result<Vec<String>, PackError>;
    fn coverage_ids(&self) -> Result<Vec<String>, PackError>;
}

#[derive(Clone)]
pub struct HttpCatalogClient {
    client: Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: &str, timeout: Duration, verify_tls: bool) -> Result<Self, PackError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ows-fieldpack/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PackError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| PackError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn wfs_capabilities_url(base_url: &str) -> String {
        format!("{base_url}/ows?service=WFS&version={WFS_VERSION}&request=GetCapabilities")
    }

    pub fn wcs_capabilities_url(base_url: &str) -> String {
        format!("{base_url}/ows?service=WCS&version={WCS_VERSION}&request=GetCapabilities")
    }

    fn fetch_text(&self, url: &str) -> Result<String, PackError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| PackError::DiscoveryHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "capability request failed".to_string());
            return Err(PackError::DiscoveryStatus {
                status: status.as_u16(),
                message: truncate(&message, 500),
            });
        }
        response
            .text()
            .map_err(|err| PackError::DiscoveryHttp(err.to_string()))
    }
}

impl CatalogClient for HttpCatalogClient {
    fn feature_type_names(&self) -> Result<Vec<String>, PackError> {
        let xml = self.fetch_text(&Self::wfs_capabilities_url(&self.base_url))?;
        Ok(parse_feature_type_names(&xml))
    }

    fn coverage_ids(&self) -> Result<Vec<String>, PackError> {
        let xml = self.fetch_text(&Self::wcs_capabilities_url(&self.base_url))?;
        Ok(parse_coverage_ids(&xml))
    }
}

/// Extract WFS feature type names from a capabilities document.
///
/// The upstream server is not schema-compliant and its namespace prefixing
/// varies between deployments, so this deliberately matches `<Name>` elements
/// structurally instead of validating the document. Only namespaced names
/// (containing `:`) are feature types; the rest are service metadata.
pub fn parse_feature_type_names(xml: &str) -> Vec<String> {
    let rx = RegexBuilder::new(r"<\s*Name\s*>([^<]+)<\s*/\s*Name\s*>")
        .case_insensitive(true)
        .build()
        .expect("static regex");
    dedup_preserving_order(
        rx.captures_iter(xml)
            .map(|cap| cap[1].trim().to_string())
            .filter(|name| name.contains(':')),
    )
}

/// Extract WCS coverage ids, with or without the `wcs:` element prefix.
pub fn parse_coverage_ids(xml: &str) -> Vec<String> {
    let rx = RegexBuilder::new(r"<\s*(?:wcs:)?CoverageId\s*>([^<]+)<\s*/\s*(?:wcs:)?CoverageId\s*>")
        .case_insensitive(true)
        .build()
        .expect("static regex");
    dedup_preserving_order(
        rx.captures_iter(xml)
            .map(|cap| cap[1].trim().to_string())
            .filter(|id| !id.is_empty()),
    )
}

fn dedup_preserving_order(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values.filter(|value| seen.insert(value.clone())).collect()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
