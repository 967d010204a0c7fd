//! Export request parameters and their validation.
//!
//! [`RequestValidator`] turns the raw query string of a `$export` call into a
//! normalized [`ExportRequest`]. Validation is a pure function of the query,
//! the API version and the supplied clock: it performs no I/O and keeps no
//! state between calls.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CoreError, Result};
use crate::time::parse_instant;

/// Accepted spellings of `_outputFormat`.
pub const SUPPORTED_OUTPUT_FORMATS: [&str; 3] =
    ["ndjson", "application/ndjson", "application/fhir+ndjson"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    Ndjson,
    ApplicationNdjson,
    #[default]
    FhirNdjson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::ApplicationNdjson => "application/ndjson",
            Self::FhirNdjson => "application/fhir+ndjson",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ndjson" => Ok(Self::Ndjson),
            "application/ndjson" => Ok(Self::ApplicationNdjson),
            "application/fhir+ndjson" => Ok(Self::FhirNdjson),
            other => Err(CoreError::unsupported_format(other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which population an export covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExportKind {
    /// Currently attributed beneficiaries only.
    #[default]
    Default,
    /// Attributed beneficiaries since `_since`, plus the full history of
    /// beneficiaries newly attributed after it.
    RetrieveNewBeneHistData,
    /// Claims runout data for beneficiaries no longer attributed.
    Runout,
}

/// Feature switches consulted when resolving a `Group/{id}` export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupFeatures {
    pub enable_new_group: bool,
    pub enable_runout: bool,
}

impl Default for GroupFeatures {
    fn default() -> Self {
        Self {
            enable_new_group: false,
            enable_runout: true,
        }
    }
}

impl ExportKind {
    /// Resolves the kind of a `Group/{group_id}/$export` request.
    ///
    /// `all` is a default request unless `_since` was supplied and the
    /// new-group feature is on. `runout` requires the runout feature.
    pub fn for_group(group_id: &str, has_since: bool, features: GroupFeatures) -> Result<Self> {
        match group_id {
            "all" if has_since && features.enable_new_group => Ok(Self::RetrieveNewBeneHistData),
            "all" => Ok(Self::Default),
            "runout" if features.enable_runout => Ok(Self::Runout),
            other => Err(CoreError::invalid_group_id(other)),
        }
    }

    pub fn retrieves_history(&self) -> bool {
        matches!(self, Self::RetrieveNewBeneHistData)
    }
}

/// Normalized, validated `$export` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub version: String,
    /// Requested types; the full supported set when `_type` was absent.
    pub resource_types: Vec<String>,
    /// Set when `_type` was absent and `resource_types` was expanded.
    pub all_types: bool,
    pub since: Option<OffsetDateTime>,
    pub output_format: OutputFormat,
    pub kind: ExportKind,
}

impl ExportRequest {
    #[must_use]
    pub fn with_kind(mut self, kind: ExportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn requests_all_types(&self) -> bool {
        self.all_types
    }

    pub fn overlaps_types(&self, other: &[String]) -> bool {
        self.resource_types.iter().any(|t| other.contains(t))
    }
}

/// Supported resource types per API version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SupportedTypes {
    versions: BTreeMap<String, Vec<String>>,
}

impl SupportedTypes {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn version<I, S>(mut self, version: impl Into<String>, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions
            .insert(version.into(), types.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_version(&self, version: &str) -> Option<&[String]> {
        self.versions.get(version).map(Vec::as_slice)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl From<BTreeMap<String, Vec<String>>> for SupportedTypes {
    fn from(versions: BTreeMap<String, Vec<String>>) -> Self {
        Self { versions }
    }
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    supported: SupportedTypes,
}

impl RequestValidator {
    pub fn new(supported: SupportedTypes) -> Self {
        Self { supported }
    }

    pub fn supported(&self) -> &SupportedTypes {
        &self.supported
    }

    /// Validates `raw_query` against the current time.
    pub fn validate(&self, version: &str, raw_query: &str) -> Result<ExportRequest> {
        self.validate_at(version, raw_query, OffsetDateTime::now_utc())
    }

    /// Validates `raw_query` (without the leading `?`) for `version`,
    /// judging `_since` against `now`.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, as a validation-category
    /// [`CoreError`].
    pub fn validate_at(
        &self,
        version: &str,
        raw_query: &str,
        now: OffsetDateTime,
    ) -> Result<ExportRequest> {
        let supported = self
            .supported
            .for_version(version)
            .ok_or_else(|| CoreError::unsupported_version(version))?;

        let mut types: Option<Vec<String>> = None;
        let mut since: Option<String> = None;
        let mut output_format: Option<String> = None;

        for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            if key.starts_with('?') {
                return Err(CoreError::malformed_query(format!(
                    "unexpected parameter name '{key}'"
                )));
            }

            match &*key {
                "_elements" => return Err(CoreError::unsupported_parameter("_elements")),
                // Output filtering is not implemented.
                "_typeFilter" => return Err(CoreError::unsupported_parameter("_typeFilter")),
                "_type" => types
                    .get_or_insert_with(Vec::new)
                    .extend(value.split(',').map(|t| t.trim().to_string())),
                "_since" => {
                    if since.replace(value.into_owned()).is_some() {
                        return Err(CoreError::malformed_query("_since supplied more than once"));
                    }
                }
                "_outputFormat" => {
                    if output_format.replace(value.into_owned()).is_some() {
                        return Err(CoreError::malformed_query(
                            "_outputFormat supplied more than once",
                        ));
                    }
                }
                _ => {}
            }
        }

        let (resource_types, all_types) = match types {
            Some(requested) => (check_types(requested, supported)?, false),
            None => (supported.to_vec(), true),
        };

        let since = since.map(|raw| check_since(&raw, now)).transpose()?;

        let output_format = output_format
            .map(|raw| raw.parse::<OutputFormat>())
            .transpose()?
            .unwrap_or_default();

        Ok(ExportRequest {
            version: version.to_string(),
            resource_types,
            all_types,
            since,
            output_format,
            kind: ExportKind::Default,
        })
    }
}

fn check_types(requested: Vec<String>, supported: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::with_capacity(requested.len());
    for resource_type in &requested {
        if !seen.insert(resource_type.as_str()) {
            return Err(CoreError::repeated_resource_type(resource_type.clone()));
        }
        if !supported.contains(resource_type) {
            return Err(CoreError::invalid_resource_type(resource_type.clone(), supported));
        }
    }
    Ok(requested)
}

fn check_since(raw: &str, now: OffsetDateTime) -> Result<OffsetDateTime> {
    let since = parse_instant(raw)?;
    if since > now {
        return Err(CoreError::invalid_date_format(
            "Date must be a date that has already passed.",
        ));
    }
    Ok(since)
}
