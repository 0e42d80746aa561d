//! HTTP transport and typed client against a local mock server.

use comic_vine::client::{
    ComicVineClient, ListOptions, RequestOrchestrator, ResourceType, RetrieveOptions, UrlBuilder,
};
use comic_vine::memory::{MemoryCacheConfig, MemoryCacheStore};
use comic_vine::remote::error_code::RemoteErrorCode;
use comic_vine::transport::{HttpConfig, HttpTransport, Transport};
use comic_vine::CacheStore;
use futures::TryStreamExt;
use mockito::{Matcher, Server, ServerGuard};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Issue {
    id: u64,
    name: Option<String>,
}

fn envelope(results: Value, offset: u32, total: u32) -> String {
    let count = results.as_array().map(|a| a.len()).unwrap_or(1) as u32;
    json!({
        "error": "OK",
        "limit": 100,
        "offset": offset,
        "number_of_page_results": count,
        "number_of_total_results": total,
        "status_code": 1,
        "results": results,
        "version": "1.0"
    })
    .to_string()
}

fn transport() -> Arc<HttpTransport> {
    Arc::new(
        HttpTransport::new(HttpConfig::default().with_timeout(Duration::from_secs(5)))
            .expect("transport"),
    )
}

fn client(server: &ServerGuard) -> ComicVineClient {
    let orchestrator = RequestOrchestrator::builder()
        .cache(Arc::new(MemoryCacheStore::new(MemoryCacheConfig::default())))
        .build(
            transport(),
            UrlBuilder::with_base_url(&server.url(), "test-key").expect("base url"),
        );
    ComicVineClient::new(orchestrator)
}

#[tokio::test]
async fn test_transport_returns_json_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/issue/4000-6/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("api_key".into(), "test-key".into()),
            Matcher::UrlEncoded("format".into(), "json".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(envelope(json!({"id": 6}), 0, 1))
        .create_async()
        .await;

    let urls = UrlBuilder::with_base_url(&server.url(), "test-key").unwrap();
    let url = urls
        .retrieve(ResourceType::Issue, 6, &RetrieveOptions::new())
        .unwrap();
    let body = transport().get(&url).await.unwrap();
    assert_eq!(body["results"]["id"], 6);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_errors_map_to_remote_codes() {
    let mut server = Server::new_async().await;
    let _throttled = server
        .mock("GET", "/issues/")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_body("slow down")
        .create_async()
        .await;
    let _missing = server
        .mock("GET", "/volumes/")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let urls = UrlBuilder::with_base_url(&server.url(), "k").unwrap();
    let http = transport();

    let err = http
        .get(&urls.list(ResourceType::Issue, &ListOptions::new()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.remote_code(), Some(RemoteErrorCode::Throttling));
    assert!(err.is_throttling());
    assert!(err.to_string().contains("429"));
    assert!(!err.to_string().contains("api_key=k"));

    let err = http
        .get(&urls.list(ResourceType::Volume, &ListOptions::new()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.remote_code(), Some(RemoteErrorCode::ResourceNotFound));
}

#[tokio::test]
async fn test_client_retrieve_is_cached() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/issue/4000-6/")
        .match_query(Matcher::UrlEncoded("field_list".into(), "id,name".into()))
        .with_status(200)
        .with_body(envelope(json!({"id": 6, "name": "The Lost Year"}), 0, 1))
        .expect(1)
        .create_async()
        .await;

    let client = client(&server);
    let options = RetrieveOptions::new().with_fields(["id", "name"]);
    for _ in 0..3 {
        let issue = client
            .retrieve::<Issue>(ResourceType::Issue, 6, &options)
            .await
            .unwrap();
        assert_eq!(issue.results.id, 6);
        assert_eq!(issue.results.name.as_deref(), Some("The Lost Year"));
    }
    mock.assert_async().await;

    let stats = client
        .orchestrator()
        .cache()
        .unwrap()
        .stats()
        .await
        .unwrap();
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn test_api_error_envelope_is_not_cached() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/issue/4000-1/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({
                "error": "Invalid API Key",
                "limit": 0,
                "offset": 0,
                "number_of_page_results": 0,
                "number_of_total_results": 0,
                "status_code": 100,
                "results": []
            })
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let client = client(&server);
    for _ in 0..2 {
        let err = client
            .retrieve::<Value>(ResourceType::Issue, 1, &RetrieveOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(RemoteErrorCode::Validation));
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_pages_follow_offsets() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("GET", "/issues/")
        .match_query(Matcher::UrlEncoded("offset".into(), "0".into()))
        .with_status(200)
        .with_body(envelope(json!([{"id": 1}, {"id": 2}]), 0, 3))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("GET", "/issues/")
        .match_query(Matcher::UrlEncoded("offset".into(), "2".into()))
        .with_status(200)
        .with_body(envelope(json!([{"id": 3}]), 2, 3))
        .expect(1)
        .create_async()
        .await;

    let client = client(&server);
    let pages: Vec<_> = client
        .pages::<Issue>(ResourceType::Issue, ListOptions::new().with_limit(2).with_offset(0))
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<u64> = pages
        .iter()
        .flat_map(|page| page.results.iter().map(|issue| issue.id))
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    first.assert_async().await;
    second.assert_async().await;
}
