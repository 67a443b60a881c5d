//! QIDO-style queries translated into C-FIND requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use dicom_core::dictionary::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;
use dimse::types::tags;
use dimse::{DimseNetwork, DimseOperation, DimseRequest, QueryLevel, RemoteNode, ResultCode};
use serde_json::Value;

use crate::config::QueryConfig;

const STUDY_RETURN_KEYS: &[&str] = &[
    "00080005", "00080020", "00080030", "00080050", "00080054", "00080056", "00080061", "00080090",
    "00081190", "00100010", "00100020", "00100030", "00100040", "0020000D", "00200010", "00201206",
    "00201208",
];

const SERIES_RETURN_KEYS: &[&str] = &[
    "00080005", "00080054", "00080056", "00080060", "0008103E", "00081190", "0020000E", "00200011",
    "00201209",
];

const IMAGE_RETURN_KEYS: &[&str] = &["00080016", "00080018"];

/// Attributes returned at `level` even when the client did not ask for them
pub fn default_return_keys(level: QueryLevel) -> &'static [&'static str] {
    match level {
        QueryLevel::Study => STUDY_RETURN_KEYS,
        QueryLevel::Series => SERIES_RETURN_KEYS,
        QueryLevel::Image => IMAGE_RETURN_KEYS,
    }
}

/// Resolve a keyword (`PatientName`) or tag (`00100010`) to 8 upper-case hex digits
pub fn resolve_tag(name: &str) -> Option<String> {
    let name = name.trim();
    if name.len() == 8 && name.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(name.to_ascii_uppercase());
    }
    StandardDataDictionary
        .parse_tag(name)
        .map(|tag| format!("{:04X}{:04X}", tag.0, tag.1))
}

/// Forwards QIDO queries to the archive. Queries are not throttled by the fetch limiter.
#[derive(Clone)]
pub struct QueryService {
    network: Arc<dyn DimseNetwork>,
    source: RemoteNode,
    target: RemoteNode,
    verbose: bool,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(
        network: Arc<dyn DimseNetwork>,
        source: RemoteNode,
        target: RemoteNode,
        verbose: bool,
        config: QueryConfig,
    ) -> Self {
        Self {
            network,
            source,
            target,
            verbose,
            config,
        }
    }

    /// Build the C-FIND identifier for `params`.
    ///
    /// Returns `None` when the PatientName filter is shorter than the configured minimum.
    pub fn build_request(
        &self,
        level: QueryLevel,
        params: &BTreeMap<String, String>,
    ) -> Option<DimseRequest> {
        let mut request = DimseRequest::new(
            DimseOperation::Find,
            self.source.clone(),
            self.target.clone(),
        )
        .with_tag(tags::QUERY_RETRIEVE_LEVEL, level.as_str())
        .verbose(self.verbose);

        let includes = params
            .get("includefield")
            .into_iter()
            .flat_map(|fields| fields.split(','))
            .map(str::trim)
            .filter(|field| !field.is_empty());
        for field in includes.chain(default_return_keys(level).iter().copied()) {
            let key = resolve_tag(field).unwrap_or_else(|| field.to_string());
            request = request.with_tag(key, "");
        }

        for (name, value) in params {
            let Some(key) = resolve_tag(name) else {
                continue;
            };

            let mut value = value.clone();
            if key == tags::PATIENT_NAME {
                if value.chars().count() < self.config.min_chars {
                    tracing::debug!(
                        "PatientName '{}' shorter than {} characters, not querying",
                        value,
                        self.config.min_chars
                    );
                    return None;
                }
                if self.config.append_wildcard {
                    value.push('*');
                }
            }
            request = request.with_tag(key, value);
        }

        Some(request)
    }

    /// Run a C-FIND and return the matching datasets in DICOM JSON form.
    ///
    /// Failures are logged and yield no matches.
    pub async fn find(&self, level: QueryLevel, params: &BTreeMap<String, String>) -> Vec<Value> {
        let Some(request) = self.build_request(level, params) else {
            return Vec::new();
        };
        let offset = params
            .get("offset")
            .and_then(|offset| offset.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let result = match self.network.execute(request).await {
            Ok(result) => result,
            Err(e) => {
                match e.raw_payload() {
                    Some(raw) => tracing::error!("C-FIND returned an unparseable result: {}", raw),
                    None => tracing::error!("C-FIND failed: {}", e),
                }
                return Vec::new();
            }
        };

        match result.code {
            ResultCode::Success => match result.matches() {
                Ok(matches) => matches.into_iter().skip(offset).collect(),
                Err(e) => {
                    tracing::error!("C-FIND container could not be decoded: {}", e);
                    Vec::new()
                }
            },
            ResultCode::Pending => {
                tracing::info!("C-FIND is pending, returning no matches");
                Vec::new()
            }
            code => {
                tracing::error!(
                    "C-FIND failure (code {}): {}",
                    code,
                    result.message.unwrap_or_default()
                );
                Vec::new()
            }
        }
    }
}
