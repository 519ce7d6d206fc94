//! FHIR REST fetcher.
//!
//! Walks search bundles of a FHIR R4 server. The HTTP client is
//! abstracted via a trait so the embedding application can plug in
//! whichever HTTP library it already uses.

use crate::auth::AuthenticatedClient;
use crate::error::{EngineError, EngineResult};
use crate::fetcher::ResourceFetcher;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fhirsync_model::{FetchRequest, FetchedResources, ResourceType};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

/// Upper bound on pages followed for one resource type.
const MAX_PAGES: usize = 1000;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a `200 OK` response with a JSON body.
    pub fn ok_json(body: &Value) -> Self {
        Self {
            status: 200,
            body: body.to_string().into_bytes(),
        }
    }

    /// Creates an empty response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// HTTP client abstraction.
#[async_trait]
pub trait FhirHttpClient: Send + Sync {
    /// Sends a GET request with a bearer token.
    ///
    /// Errors are transport failures. HTTP error statuses are returned as
    /// responses.
    async fn get(&self, url: &str, bearer_token: &str) -> Result<HttpResponse, String>;
}

/// Fetches resources through the FHIR search API.
pub struct RestFetcher<C: FhirHttpClient> {
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: FhirHttpClient> RestFetcher<C> {
    /// Creates a fetcher over an HTTP client.
    pub fn new(client: C) -> Self {
        Self {
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn get_json(&self, url: &str, token: &str) -> EngineResult<Value> {
        let response = self
            .client
            .get(url, token)
            .await
            .map_err(|e| self.record(EngineError::fetch_retryable(e)))?;

        match response.status {
            200..=299 => {}
            401 | 403 => {
                return Err(self.record(EngineError::AuthenticationFailed(format!(
                    "server answered {} for {url}",
                    response.status
                ))))
            }
            429 | 500..=599 => {
                return Err(self.record(EngineError::fetch_retryable(format!(
                    "server answered {} for {url}",
                    response.status
                ))))
            }
            status => {
                return Err(self.record(EngineError::fetch_fatal(format!(
                    "server answered {status} for {url}"
                ))))
            }
        }

        *self.last_error.write() = None;
        serde_json::from_slice(&response.body).map_err(|e| {
            self.record(EngineError::fetch_fatal(format!(
                "invalid JSON from {url}: {e}"
            )))
        })
    }

    fn record(&self, error: EngineError) -> EngineError {
        *self.last_error.write() = Some(error.to_string());
        error
    }
}

#[async_trait]
impl<C: FhirHttpClient> ResourceFetcher for RestFetcher<C> {
    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        request: &FetchRequest,
    ) -> EngineResult<FetchedResources> {
        let base = client.connection.server_url.trim_end_matches('/');
        let patient = client.connection.patient_id.as_deref();
        let token = client.access_token.secret();
        let mut fetched = FetchedResources::default();

        if request.include_patient {
            if let Some(patient) = patient {
                let url = format!("{base}/Patient/{patient}");
                fetched.patient = Some(self.get_json(&url, token).await?);
            }
        }

        for &resource_type in &request.resource_types {
            if resource_type == ResourceType::Patient {
                continue;
            }
            let mut next = Some(search_url(
                base,
                resource_type,
                patient,
                request.since,
                request.page_size,
            ));
            let mut pages = 0;
            while let Some(url) = next.take() {
                if pages == MAX_PAGES {
                    return Err(EngineError::fetch_fatal(format!(
                        "{resource_type} search exceeded {MAX_PAGES} pages"
                    )));
                }
                pages += 1;

                let bundle = self.get_json(&url, token).await?;
                if let Some(bucket) = fetched.bucket_mut(resource_type) {
                    bucket.extend(bundle_resources(&bundle, resource_type));
                }
                next = next_link(&bundle);
            }
            debug!(
                resource_type = %resource_type,
                pages,
                count = fetched.count(resource_type),
                "search complete"
            );
        }

        Ok(fetched)
    }
}

/// Builds the first search URL for a resource type.
pub fn search_url(
    base: &str,
    resource_type: ResourceType,
    patient: Option<&str>,
    since: Option<DateTime<Utc>>,
    page_size: u32,
) -> String {
    let mut url = format!("{base}/{resource_type}?_count={page_size}");
    if let Some(patient) = patient {
        url.push_str("&patient=");
        url.push_str(patient);
    }
    if let Some(since) = since {
        url.push_str("&_lastUpdated=gt");
        url.push_str(&since.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    url
}

fn bundle_resources(bundle: &Value, resource_type: ResourceType) -> Vec<Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| entry.get("resource"))
        .filter(|resource| {
            resource.get("resourceType").and_then(Value::as_str) == Some(resource_type.as_str())
        })
        .cloned()
        .collect()
}

fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, Connection};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestClient {
        responses: Mutex<HashMap<String, HttpResponse>>,
        requested: Mutex<Vec<String>>,
    }

    impl TestClient {
        fn respond(&self, url: &str, response: HttpResponse) {
            self.responses.lock().insert(url.to_string(), response);
        }
    }

    #[async_trait]
    impl FhirHttpClient for TestClient {
        async fn get(&self, url: &str, bearer_token: &str) -> Result<HttpResponse, String> {
            assert_eq!(bearer_token, "token");
            self.requested.lock().push(url.to_string());
            self.responses
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| format!("connection refused: {url}"))
        }
    }

    fn client() -> AuthenticatedClient {
        AuthenticatedClient::new(
            Connection::new("conn-1", "https://fhir.example.com/r4/").with_patient("pat-1"),
            AccessToken::new("token"),
        )
    }

    fn bundle(resources: Vec<Value>, next: Option<&str>) -> Value {
        let mut bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": resources.into_iter().map(|r| json!({"resource": r})).collect::<Vec<_>>(),
        });
        if let Some(next) = next {
            bundle["link"] = json!([{"relation": "next", "url": next}]);
        }
        bundle
    }

    #[test]
    fn search_url_with_since() {
        let since = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let url = search_url(
            "https://fhir.example.com/r4",
            ResourceType::Observation,
            Some("pat-1"),
            Some(since),
            50,
        );
        assert_eq!(
            url,
            "https://fhir.example.com/r4/Observation?_count=50&patient=pat-1&_lastUpdated=gt2024-01-02T03:04:05Z"
        );
    }

    #[tokio::test]
    async fn follows_next_links_and_reads_patient() {
        let http = TestClient::default();
        let first = "https://fhir.example.com/r4/Condition?_count=2&patient=pat-1";
        let second = "https://fhir.example.com/r4/Condition?page=2";
        http.respond(
            "https://fhir.example.com/r4/Patient/pat-1",
            HttpResponse::ok_json(&json!({"resourceType": "Patient", "id": "pat-1"})),
        );
        http.respond(
            first,
            HttpResponse::ok_json(&bundle(
                vec![
                    json!({"resourceType": "Condition", "id": "c1"}),
                    json!({"resourceType": "OperationOutcome"}),
                ],
                Some(second),
            )),
        );
        http.respond(
            second,
            HttpResponse::ok_json(&bundle(
                vec![json!({"resourceType": "Condition", "id": "c2"})],
                None,
            )),
        );

        let fetcher = RestFetcher::new(http);
        let request = FetchRequest::full(vec![ResourceType::Patient, ResourceType::Condition], 2);
        let fetched = fetcher.fetch(&client(), &request).await.unwrap();

        assert!(fetched.patient.is_some());
        assert_eq!(fetched.conditions.len(), 2);
        assert!(fetcher.last_error().is_none());
    }

    #[tokio::test]
    async fn unauthorized_is_authentication_failure() {
        let http = TestClient::default();
        http.respond(
            "https://fhir.example.com/r4/Immunization?_count=10&patient=pat-1",
            HttpResponse::status(401),
        );
        let fetcher = RestFetcher::new(http);
        let request = FetchRequest::full(vec![ResourceType::Immunization], 10);

        let err = fetcher.fetch(&client(), &request).await.unwrap_err();
        assert!(err.is_authentication());
        assert!(fetcher.last_error().is_some());
    }

    #[tokio::test]
    async fn transport_and_server_errors() {
        let http = TestClient::default();
        http.respond(
            "https://fhir.example.com/r4/Condition?_count=10&patient=pat-1",
            HttpResponse::status(503),
        );
        let fetcher = RestFetcher::new(http);

        let err = fetcher
            .fetch(&client(), &FetchRequest::full(vec![ResourceType::Condition], 10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let err = fetcher
            .fetch(
                &client(),
                &FetchRequest::full(vec![ResourceType::AllergyIntolerance], 10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Fetch { retryable: true, .. }));
    }
}
