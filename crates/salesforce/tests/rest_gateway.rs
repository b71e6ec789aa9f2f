use std::time::Duration;

use crmgate_core::auth::{AccessCredential, AuthError, TokenRefresher};
use crmgate_core::gateway::{CrmGateway, Filter, GatewayError, QuerySpec, SearchRequest};
use crmgate_salesforce::{OAuthRefresher, SalesforceGateway};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential(server: &MockServer) -> AccessCredential {
    AccessCredential { access_token: SecretString::from("session-token"), instance_url: server.uri() }
}

fn gateway() -> SalesforceGateway {
    SalesforceGateway::new("62.0", Duration::from_secs(5)).expect("gateway")
}

#[tokio::test]
async fn query_sends_rendered_soql_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/query"))
        .and(query_param("q", "SELECT Id, Name FROM Account WHERE Name LIKE '%O\\'Neil%' LIMIT 6"))
        .and(header("authorization", "Bearer session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 1,
            "done": true,
            "records": [{ "attributes": { "type": "Account" }, "Id": "001000000000001AAA", "Name": "O'Neil Labs" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let spec = QuerySpec::new("Account", &["Id", "Name"]).filter(Some(Filter::contains("Name", "O'Neil"))).limit(6);
    let records = gateway().query(&credential(&server), &spec).await.expect("query");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("Name"), Some(&json!("O'Neil Labs")));
    assert!(records[0].get("attributes").is_none());
}

fn account_rows(from: usize, count: usize) -> Vec<Value> {
    (from..from + count)
        .map(|n| json!({ "attributes": { "type": "Account" }, "Id": format!("001{n:015}"), "Name": format!("Account {n}") }))
        .collect()
}

#[tokio::test]
async fn query_follows_next_records_url_until_the_limit_is_filled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 10,
            "done": false,
            "nextRecordsUrl": "/services/data/v62.0/query/01gD0000002HU6KIAW-3",
            "records": account_rows(0, 3)
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/query/01gD0000002HU6KIAW-3"))
        .and(header("authorization", "Bearer session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 10,
            "done": false,
            "nextRecordsUrl": "/services/data/v62.0/query/01gD0000002HU6KIAW-6",
            "records": account_rows(3, 3)
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/query/01gD0000002HU6KIAW-6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 10,
            "done": true,
            "records": account_rows(6, 4)
        })))
        .expect(0)
        .mount(&server)
        .await;

    let spec = QuerySpec::new("Account", &["Id", "Name"]).limit(6);
    let records = gateway().query(&credential(&server), &spec).await.expect("query");

    assert_eq!(records.len(), 6);
    assert_eq!(records[5].get("Name"), Some(&json!("Account 5")));
    assert!(records.iter().all(|record| record.get("attributes").is_none()));
}

#[tokio::test]
async fn query_stops_when_the_cursor_is_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 5,
            "done": false,
            "nextRecordsUrl": "/services/data/v62.0/query/01gD0000002HU6KIAW-3",
            "records": account_rows(0, 3)
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/query/01gD0000002HU6KIAW-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 5,
            "done": true,
            "records": account_rows(3, 2)
        })))
        .expect(1)
        .mount(&server)
        .await;

    let spec = QuerySpec::new("Account", &["Id", "Name"]).limit(26);
    let records = gateway().query(&credential(&server), &spec).await.expect("query");

    assert_eq!(records.len(), 5);
}

#[tokio::test]
async fn search_reads_search_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v62.0/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "searchRecords": [{ "attributes": { "type": "Account" }, "Id": "001000000000002AAA", "Name": "Acme" }]
        })))
        .mount(&server)
        .await;

    let mut request = SearchRequest::new("Acme", "Account", &["Id", "Name"]);
    request.limit = 5;
    let records = gateway().search(&credential(&server), &request).await.expect("search");

    assert_eq!(records[0].get("Id"), Some(&json!("001000000000002AAA")));
}

#[tokio::test]
async fn create_and_update_hit_sobject_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/data/v62.0/sobjects/Task"))
        .and(body_string_contains("Follow up"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "id": "00T000000000001AAA", "success": true, "errors": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/services/data/v62.0/sobjects/Lead/00Q000000000001AAA"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut task = Map::new();
    task.insert("Subject".to_string(), Value::from("Follow up"));
    let id = gateway().create(&credential(&server), "Task", &task).await.expect("create");
    assert_eq!(id, "00T000000000001AAA");

    let mut lead = Map::new();
    lead.insert("Status".to_string(), Value::from("Working"));
    gateway().update(&credential(&server), "Lead", "00Q000000000001AAA", &lead).await.expect("update");
}

#[tokio::test]
async fn expired_session_surfaces_as_session_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!([{ "message": "Session expired or invalid", "errorCode": "INVALID_SESSION_ID" }])),
        )
        .mount(&server)
        .await;

    let error = gateway()
        .query(&credential(&server), &QuerySpec::new("Account", &["Id"]))
        .await
        .expect_err("401 must fail");
    assert_eq!(error, GatewayError::SessionExpired);
}

#[tokio::test]
async fn slow_responses_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)).set_body_json(json!({ "records": [] })))
        .mount(&server)
        .await;

    let gateway = SalesforceGateway::new("v62.0", Duration::from_millis(50)).expect("gateway");
    let error = gateway
        .query(&credential(&server), &QuerySpec::new("Account", &["Id"]))
        .await
        .expect_err("must time out");
    assert!(matches!(error, GatewayError::Timeout(_)));
}

#[tokio::test]
async fn refresh_grant_posts_form_and_returns_new_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "instance_url": "https://example.my.salesforce.com",
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let refresher = OAuthRefresher::new(
        format!("{}/services/oauth2/token", server.uri()),
        "client-id",
        SecretString::from("client-secret"),
        Duration::from_secs(5),
    )
    .expect("refresher");
    let token = refresher.refresh(&SecretString::from("refresh-1")).await.expect("refresh");

    assert_eq!(token.access_token.expose_secret(), "fresh-token");
    assert_eq!(token.instance_url.as_deref(), Some("https://example.my.salesforce.com"));
    assert!(token.refresh_token.is_none());
    assert!(token.expires_in.is_none());
}

#[tokio::test]
async fn oversized_token_lifetime_is_capped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "expires_in": i64::MAX
        })))
        .mount(&server)
        .await;

    let refresher = OAuthRefresher::new(
        format!("{}/services/oauth2/token", server.uri()),
        "client-id",
        SecretString::from("client-secret"),
        Duration::from_secs(5),
    )
    .expect("refresher");
    let token = refresher.refresh(&SecretString::from("refresh-1")).await.expect("refresh");

    assert_eq!(token.expires_in, Some(chrono::Duration::days(30)));
}

#[tokio::test]
async fn revoked_refresh_grant_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "error": "invalid_grant", "error_description": "expired access/refresh token" })),
        )
        .mount(&server)
        .await;

    let refresher = OAuthRefresher::new(
        format!("{}/services/oauth2/token", server.uri()),
        "client-id",
        SecretString::from("client-secret"),
        Duration::from_secs(5),
    )
    .expect("refresher");
    let error = refresher.refresh(&SecretString::from("stale")).await.expect_err("rejected");

    assert_eq!(error, AuthError::RefreshRejected("expired access/refresh token".to_string()));
}
