use std::time::Duration;

use async_trait::async_trait;
use crmgate_core::auth::AccessCredential;
use crmgate_core::config::SalesforceConfig;
use crmgate_core::domain::records::CrmRecord;
use crmgate_core::gateway::{CrmGateway, GatewayError, QuerySpec, SearchRequest};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::soql::{render_query, render_search};

/// REST adapter. The instance host comes from each credential, so one gateway
/// serves every user of the process.
#[derive(Clone, Debug)]
pub struct SalesforceGateway {
    client: Client,
    api_version: String,
    timeout: Duration,
}

impl SalesforceGateway {
    pub fn new(api_version: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| GatewayError::Transport(format!("http client setup failed: {error}")))?;
        Ok(Self { client, api_version: api_version.trim_start_matches('v').to_string(), timeout })
    }

    pub fn from_config(config: &SalesforceConfig) -> Result<Self, GatewayError> {
        Self::new(&config.api_version, Duration::from_secs(config.timeout_secs))
    }

    fn endpoint(&self, credential: &AccessCredential, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            credential.instance_url.trim_end_matches('/'),
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    async fn send(
        &self,
        request: RequestBuilder,
        credential: &AccessCredential,
        object: &str,
    ) -> Result<Response, GatewayError> {
        let response = request
            .bearer_auth(credential.access_token.expose_secret())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body, object))
    }

    fn transport_error(&self, error: reqwest::Error) -> GatewayError {
        if error.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Transport(error.to_string())
        }
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default = "default_done")]
    done: bool,
    #[serde(default, rename = "nextRecordsUrl")]
    next_records_url: Option<String>,
}

fn default_done() -> bool {
    true
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default, rename = "searchRecords")]
    search_records: Vec<Value>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    success: bool,
}

#[derive(Deserialize)]
struct ApiFailure {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "errorCode")]
    error_code: String,
}

#[async_trait]
impl CrmGateway for SalesforceGateway {
    async fn query(&self, credential: &AccessCredential, spec: &QuerySpec) -> Result<Vec<CrmRecord>, GatewayError> {
        let soql = render_query(spec);
        debug!(event_name = "salesforce.query", object = %spec.object, limit = spec.limit, "issuing query");

        let request = self.client.get(self.endpoint(credential, "query")).query(&[("q", soql.as_str())]);
        let response = self.send(request, credential, &spec.object).await?;
        let mut page: QueryResponse = decode(response).await?;
        let mut records = page.records;

        // Large results arrive in batches; keep reading until the requested
        // window is filled or the cursor runs out.
        let wanted = spec.limit as usize;
        while !page.done && records.len() < wanted {
            let Some(next) = page.next_records_url.take() else {
                break;
            };
            debug!(event_name = "salesforce.query_page", object = %spec.object, read = records.len(), "reading next batch");
            let url = format!("{}{}", credential.instance_url.trim_end_matches('/'), next);
            let response = self.send(self.client.get(url), credential, &spec.object).await?;
            page = decode(response).await?;
            records.append(&mut page.records);
        }
        records.truncate(wanted);
        Ok(into_records(records))
    }

    async fn search(
        &self,
        credential: &AccessCredential,
        request: &SearchRequest,
    ) -> Result<Vec<CrmRecord>, GatewayError> {
        let sosl = render_search(request);
        debug!(event_name = "salesforce.search", object = %request.object, limit = request.limit, "issuing search");

        let http = self.client.get(self.endpoint(credential, "search")).query(&[("q", sosl.as_str())]);
        let response = self.send(http, credential, &request.object).await?;
        let body: SearchResponse = decode(response).await?;
        Ok(into_records(body.search_records))
    }

    async fn create(
        &self,
        credential: &AccessCredential,
        object: &str,
        fields: &CrmRecord,
    ) -> Result<String, GatewayError> {
        let request = self.client.post(self.endpoint(credential, &format!("sobjects/{object}"))).json(fields);
        let response = self.send(request, credential, object).await?;
        let created: CreateResponse = decode(response).await?;
        if !created.success || created.id.is_empty() {
            return Err(GatewayError::Api {
                status: StatusCode::CREATED.as_u16(),
                code: "CREATE_NOT_CONFIRMED".to_string(),
                message: format!("{object} create returned no record id"),
            });
        }
        Ok(created.id)
    }

    async fn update(
        &self,
        credential: &AccessCredential,
        object: &str,
        record_id: &str,
        fields: &CrmRecord,
    ) -> Result<(), GatewayError> {
        let request =
            self.client.patch(self.endpoint(credential, &format!("sobjects/{object}/{record_id}"))).json(fields);
        self.send(request, credential, object).await?;
        Ok(())
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, GatewayError> {
    response.json::<T>().await.map_err(|error| GatewayError::Api {
        status: StatusCode::OK.as_u16(),
        code: "UNREADABLE_RESPONSE".to_string(),
        message: error.to_string(),
    })
}

fn into_records(values: Vec<Value>) -> Vec<CrmRecord> {
    values
        .into_iter()
        .filter_map(|mut value| {
            strip_attributes(&mut value);
            match value {
                Value::Object(record) => Some(record),
                _ => None,
            }
        })
        .collect()
}

/// Removes the per-record `attributes` metadata at every depth, including
/// relationship fields and child subquery results.
fn strip_attributes(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("attributes");
            map.values_mut().for_each(strip_attributes);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_attributes),
        _ => {}
    }
}

pub(crate) fn classify_failure(status: StatusCode, body: &str, object: &str) -> GatewayError {
    let failure = serde_json::from_str::<Vec<ApiFailure>>(body)
        .ok()
        .and_then(|failures| failures.into_iter().next())
        .unwrap_or(ApiFailure { message: body.chars().take(200).collect(), error_code: String::new() });

    warn!(
        event_name = "salesforce.request_failed",
        status = status.as_u16(),
        error_code = %failure.error_code,
        object = %object,
        message = %failure.message,
        "salesforce rejected request"
    );

    let code = failure.error_code.as_str();
    match code {
        "INVALID_SESSION_ID" => return GatewayError::SessionExpired,
        "REQUEST_LIMIT_EXCEEDED" => return GatewayError::QuotaExhausted,
        "NOT_FOUND" | "ENTITY_IS_DELETED" => return GatewayError::NotFound(failure.message),
        "INVALID_TYPE" if object.starts_with("Knowledge") => {
            return GatewayError::FeatureUnavailable(failure.message)
        }
        "MALFORMED_QUERY"
        | "MALFORMED_SEARCH"
        | "INVALID_FIELD"
        | "INVALID_TYPE"
        | "INVALID_QUERY_FILTER_OPERATOR"
        | "QUERY_TOO_COMPLICATED"
        | "MALFORMED_ID"
        | "INVALID_CROSS_REFERENCE_KEY"
        | "INVALID_OR_NULL_FOR_RESTRICTED_PICKLIST"
        | "REQUIRED_FIELD_MISSING"
        | "STRING_TOO_LONG"
        | "FIELD_CUSTOM_VALIDATION_EXCEPTION" => return GatewayError::InvalidRequest(failure.message),
        _ if code.starts_with("INSUFFICIENT_ACCESS") => return GatewayError::PermissionDenied(failure.message),
        _ => {}
    }

    match status {
        StatusCode::UNAUTHORIZED => GatewayError::SessionExpired,
        StatusCode::FORBIDDEN => GatewayError::PermissionDenied(failure.message),
        StatusCode::NOT_FOUND => GatewayError::NotFound(failure.message),
        _ => GatewayError::Api { status: status.as_u16(), code: failure.error_code, message: failure.message },
    }
}
