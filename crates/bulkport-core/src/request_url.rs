//! Recovering export parameters from a stored request URL.

use std::sync::LazyLock;

use url::Url;

use crate::error::{CoreError, Result};

static VERSION_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"/api/(v\d+)/").expect("Invalid version regex"));

/// What a live job asked for, as recorded in its request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrlInfo {
    pub version: String,
    /// `None` when the request had no `_type` (all types).
    pub resource_types: Option<Vec<String>>,
}

impl RequestUrlInfo {
    pub fn requests_all_types(&self) -> bool {
        self.resource_types.is_none()
    }
}

/// Extracts the API version (`v1`, `v2`, ...) from a request path.
pub fn api_version(path: &str) -> Option<&str> {
    VERSION_REGEX
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parses a canonical request URL back into its version and `_type` set.
///
/// # Errors
///
/// Returns [`CoreError::InvalidRequestUrl`] if the URL does not parse or has
/// no `/api/{version}/` segment.
pub fn parse_request_url(request_url: &str) -> Result<RequestUrlInfo> {
    let url = Url::parse(request_url)
        .map_err(|e| CoreError::invalid_request_url(format!("{request_url}: {e}")))?;

    let version = api_version(url.path())
        .ok_or_else(|| CoreError::invalid_request_url(format!("{request_url}: no API version")))?
        .to_string();

    let mut resource_types: Option<Vec<String>> = None;
    for (key, value) in url.query_pairs() {
        if key == "_type" {
            resource_types.get_or_insert_with(Vec::new).extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
    }

    Ok(RequestUrlInfo {
        version,
        resource_types,
    })
}

/// Percent-decoded form of a request URL, used for equality comparisons.
///
/// Falls back to the input when it is not a valid URL.
pub fn unescape(request_url: &str) -> String {
    let Ok(url) = Url::parse(request_url) else {
        return request_url.to_string();
    };

    let mut out = format!("{}{}", url.origin().ascii_serialization(), url.path());
    let pairs: Vec<String> = url
        .query_pairs()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if !pairs.is_empty() {
        out.push('?');
        out.push_str(&pairs.join("&"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types_and_version() {
        let info = parse_request_url(
            "https://api.example.org/api/v2/Patient/$export?_type=Patient,Coverage&_since=2020-01-01T00:00:00Z",
        )
        .unwrap();
        assert_eq!(info.version, "v2");
        assert_eq!(
            info.resource_types,
            Some(vec!["Patient".to_string(), "Coverage".to_string()])
        );
        assert!(!info.requests_all_types());
    }

    #[test]
    fn test_missing_type_means_all_types() {
        let info =
            parse_request_url("http://localhost:3000/api/v1/Group/all/$export").unwrap();
        assert_eq!(info.version, "v1");
        assert!(info.requests_all_types());
    }

    #[test]
    fn test_encoded_type_list() {
        let info = parse_request_url(
            "http://localhost/api/v1/Patient/$export?_type=Patient%2CExplanationOfBenefit",
        )
        .unwrap();
        assert_eq!(
            info.resource_types,
            Some(vec!["Patient".to_string(), "ExplanationOfBenefit".to_string()])
        );
    }

    #[test]
    fn test_unparsable_urls() {
        assert!(parse_request_url("not a url").is_err());
        assert!(parse_request_url("http://localhost/Patient/$export").is_err());
    }

    #[test]
    fn test_unescape_normalises_encoding() {
        assert_eq!(
            unescape("http://h/api/v1/Patient/$export?_type=Patient%2CCoverage"),
            unescape("http://h/api/v1/Patient/$export?_type=Patient,Coverage"),
        );
    }
}
