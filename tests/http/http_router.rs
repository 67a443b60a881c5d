#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{instance_bytes, Harness, MockArchive, Reply};
use dimse::{DimseNetwork, RemoteNode};
use pacs_proxy::adapters::http::{build_router, AppState};
use pacs_proxy::config::QueryConfig;
use pacs_proxy::query::QueryService;
use tower::ServiceExt; // for Router::oneshot

fn app(harness: &Harness) -> axum::Router {
    let network: Arc<dyn DimseNetwork> = harness.archive.clone();
    let source = RemoteNode::new("PROXY", "127.0.0.1", 8888);
    let target = RemoteNode::new("ARCHIVE", "127.0.0.1", 11112);
    let query = QueryService::new(
        network.clone(),
        source.clone(),
        target.clone(),
        false,
        QueryConfig::default(),
    );

    build_router(AppState {
        pipeline: harness.pipeline.clone(),
        query,
        network,
        source,
        target,
    })
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, content_type, body)
}

#[tokio::test]
async fn wadouri_returns_instance_bytes() {
    let harness = Harness::new(MockArchive::new().with_instances(&[("1.2.3", "1.2.3.4.5")]));

    let (status, content_type, body) = get(
        app(&harness),
        "/wadouri?requestType=WADO&studyUID=1.2.3&seriesUID=1.2.3.4&objectUID=1.2.3.4.5&contentType=application%2Fdicom",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/dicom"));
    assert_eq!(body, instance_bytes("1.2.3.4.5"));
}

#[tokio::test]
async fn wadouri_missing_parameter_is_bad_request() {
    let harness = Harness::new(MockArchive::new());

    let (status, _, body) = get(app(&harness), "/wadouri?studyUID=1.2.3&seriesUID=1.2.3.4").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8(body).unwrap().contains("objectUID"));
    assert!(harness.archive.requests().is_empty());
}

#[tokio::test]
async fn wadouri_path_traversal_is_bad_request() {
    let harness = Harness::new(MockArchive::new());

    let (status, _, _) = get(
        app(&harness),
        "/wadouri?studyUID=..&seriesUID=1.2.3.4&objectUID=1.2.3.4.5",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wadouri_archive_failure_is_bad_gateway() {
    let harness = Harness::new(MockArchive::new().with_reply(Reply::Code(99)));

    let (status, _, _) = get(
        app(&harness),
        "/wadouri?studyUID=1.2.3&seriesUID=1.2.3.4&objectUID=1.2.3.4.5",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn wadouri_missing_file_after_fetch_is_not_found() {
    let harness = Harness::new(MockArchive::new());

    let (status, _, _) = get(
        app(&harness),
        "/wadouri?studyUID=1.2.3&seriesUID=1.2.3.4&objectUID=1.2.3.4.5",
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn qido_series_query_is_scoped_to_the_study() {
    let container = r#"[{"0020000E":{"vr":"UI","Value":["1.2.3.4"]}}]"#;
    let harness = Harness::new(MockArchive::new().with_find_container(container));

    let (status, content_type, body) = get(
        app(&harness),
        "/rs/studies/1.2.3/series?includefield=SeriesDescription",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/dicom+json"));
    let matches: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(matches[0]["0020000E"]["Value"][0], "1.2.3.4");

    let find = harness.archive.requests().pop().unwrap();
    assert_eq!(find.tag_value("00080052"), Some("SERIES"));
    assert_eq!(
        find.tags.last().map(|t| (t.key.as_str(), t.value.as_str())),
        Some(("0020000D", "1.2.3"))
    );
}

#[tokio::test]
async fn qido_failure_returns_empty_array() {
    let harness = Harness::new(MockArchive::new().with_find_container("{not json"));

    let (status, _, body) = get(app(&harness), "/rs/studies?PatientID=P1").await;

    assert_eq!(status, StatusCode::OK);
    let matches: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(matches, serde_json::json!([]));
}

#[tokio::test]
async fn echo_reports_archive_status() {
    let harness = Harness::new(MockArchive::new());

    let (status, _, body) = get(app(&harness), "/echo").await;

    assert_eq!(status, StatusCode::OK);
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["code"], 0);
    assert_eq!(reply["target"], "ARCHIVE");
}

#[tokio::test]
async fn cache_listing_shows_fetched_studies() {
    let harness = Harness::new(MockArchive::new().with_instances(&[("1.2.3", "1.2.3.4.5")]));
    let router = app(&harness);

    let (status, _, _) = get(
        router.clone(),
        "/wadouri?studyUID=1.2.3&seriesUID=1.2.3.4&objectUID=1.2.3.4.5",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(router, "/cache").await;
    assert_eq!(status, StatusCode::OK);
    let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["study_uid"], "1.2.3");
}
