use std::time::Duration;

use chrono::{DateTime, Utc};
use gripe_adapters::{CpscConnector, HarvestContext, SourceConnector};
use gripe_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        courtesy_delay: Duration::ZERO,
        backoff: BackoffPolicy {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    })
    .expect("fetcher")
}

fn ctx() -> HarvestContext {
    HarvestContext {
        run_id: Uuid::new_v4(),
        published_after: DateTime::parse_from_rfc3339("2026-09-16T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    }
}

fn recall(id: u64, date: &str, title: &str) -> serde_json::Value {
    json!({
        "RecallID": id,
        "RecallDate": date,
        "Title": title,
        "Description": "Handle can break off while pouring hot water.",
        "Hazards": [{"Name": "Burn"}],
        "Remedies": [{"Name": "Replace"}],
        "Products": [{"Name": "Kettle"}]
    })
}

fn connector(server: &MockServer) -> CpscConnector {
    CpscConnector::new().with_base_url(&format!("{}/RestWebServices/Recall", server.uri()))
}

#[tokio::test]
async fn search_merges_description_and_title_queries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/RestWebServices/Recall"))
        .and(query_param("format", "json"))
        .and(query_param("RecallDescription", "kettle"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            recall(1, "2026-10-01T00:00:00", "Acme Kettles Recalled"),
            recall(2, "2026-10-02T00:00:00", "Brio Kettles Recalled"),
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/RestWebServices/Recall"))
        .and(query_param("Title", "kettle"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            recall(1, "2026-10-01T00:00:00", "Acme Kettles Recalled"),
            recall(3, "2025-01-01T00:00:00", "Ancient Kettles Recalled"),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let http = fetcher();
    let cpsc = connector(&server);
    let ids = cpsc.search(&http, &ctx(), "kettle", 500).await;
    assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);

    let details = cpsc.list_details(&http, &ctx(), "2", 1).await;
    assert_eq!(details.len(), 1);
    assert_eq!(
        details[0].text,
        "Brio Kettles Recalled — Handle can break off while pouring hot water."
    );
    assert_eq!(details[0].extra["hazard"], "Burn");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // Details are handed out once; the cache does not outlive the topic.
    assert!(cpsc.list_details(&http, &ctx(), "2", 1).await.is_empty());
    assert_eq!(cpsc.list_details(&http, &ctx(), "1", 1).await.len(), 1);
    assert!(cpsc.list_details(&http, &ctx(), "1", 1).await.is_empty());
}

#[tokio::test]
async fn one_failed_query_does_not_abort_the_term() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/RestWebServices/Recall"))
        .and(query_param("RecallDescription", "stroller"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/RestWebServices/Recall"))
        .and(query_param("Title", "stroller"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([recall(
            7,
            "2026-10-05",
            "Strollers Recalled Due to Fall Hazard"
        )])))
        .mount(&server)
        .await;

    let ids = connector(&server)
        .search(&fetcher(), &ctx(), "stroller", 500)
        .await;
    assert_eq!(ids, vec!["7".to_string()]);
}

#[tokio::test]
async fn search_respects_max_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/RestWebServices/Recall"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            recall(1, "2026-10-01", "Acme Kettles Recalled"),
            recall(2, "2026-10-01", "Brio Kettles Recalled"),
            recall(3, "2026-10-01", "Cato Kettles Recalled"),
        ])))
        .mount(&server)
        .await;

    let ids = connector(&server)
        .search(&fetcher(), &ctx(), "kettle", 2)
        .await;
    assert_eq!(ids.len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_ids_have_no_details() {
    let server = MockServer::start().await;
    let details = connector(&server)
        .list_details(&fetcher(), &ctx(), "missing", 1)
        .await;
    assert!(details.is_empty());
}
