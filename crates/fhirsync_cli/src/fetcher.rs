//! A fetcher that reads FHIR resources from a directory of JSON files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fhirsync_engine::{AuthenticatedClient, EngineError, EngineResult, ResourceFetcher};
use fhirsync_model::mapping::parse_timestamp;
use fhirsync_model::{FetchRequest, FetchedResources, ResourceType};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Serves `*.json` files holding FHIR `Bundle`s or bare resources.
///
/// Files are read in name order on every fetch. Resources whose
/// `meta.lastUpdated` is not after `since` are left out of incremental
/// fetches; resources without a timestamp are always included.
#[derive(Debug, Clone, Default)]
pub struct BundleDirFetcher {
    dir: Option<PathBuf>,
}

impl BundleDirFetcher {
    /// Creates a fetcher over a directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// Creates a fetcher with no source; every fetch fails.
    pub fn detached() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceFetcher for BundleDirFetcher {
    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        request: &FetchRequest,
    ) -> EngineResult<FetchedResources> {
        let dir = self
            .dir
            .as_deref()
            .ok_or_else(|| EngineError::fetch_fatal("no bundle directory given"))?;
        let resources = read_resources(dir)?;
        debug!(dir = %dir.display(), count = resources.len(), "bundle directory read");
        Ok(sort_resources(
            resources,
            request,
            client.connection.patient_id.as_deref(),
        ))
    }
}

fn read_resources(dir: &Path) -> EngineResult<Vec<Value>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| EngineError::fetch_fatal(format!("{}: {e}", dir.display())))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut resources = Vec::new();
    for path in paths {
        let bytes = fs::read(&path)
            .map_err(|e| EngineError::fetch_fatal(format!("{}: {e}", path.display())))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::fetch_fatal(format!("{}: {e}", path.display())))?;
        unpack(value, &mut resources);
    }
    Ok(resources)
}

fn unpack(value: Value, out: &mut Vec<Value>) {
    if value.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        out.push(value);
        return;
    }
    let Some(Value::Array(entries)) = value.get("entry").cloned() else {
        return;
    };
    for mut entry in entries {
        if let Some(resource) = entry.get_mut("resource").map(Value::take) {
            unpack(resource, out);
        }
    }
}

fn sort_resources(
    resources: Vec<Value>,
    request: &FetchRequest,
    patient_id: Option<&str>,
) -> FetchedResources {
    let mut fetched = FetchedResources::default();
    for resource in resources {
        let Some(resource_type) = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<ResourceType>().ok())
        else {
            continue;
        };
        if resource_type == ResourceType::Patient {
            if !request.include_patient {
                continue;
            }
            let id = resource.get("id").and_then(Value::as_str);
            if fetched.patient.is_none() && (patient_id.is_none() || id == patient_id) {
                fetched.patient = Some(resource);
            }
            continue;
        }

        if !request.wants(resource_type) {
            continue;
        }
        if let Some(since) = request.since {
            if !updated_after(&resource, since) {
                continue;
            }
        }
        if let Some(bucket) = fetched.bucket_mut(resource_type) {
            bucket.push(resource);
        }
    }
    fetched
}

fn updated_after(resource: &Value, since: DateTime<Utc>) -> bool {
    let Some(raw) = resource.pointer("/meta/lastUpdated").and_then(Value::as_str) else {
        return true;
    };
    match parse_timestamp("meta.lastUpdated", raw) {
        Ok(updated) => updated > since,
        Err(e) => {
            warn!(error = %e, "unreadable lastUpdated, keeping resource");
            true
        }
    }
}
