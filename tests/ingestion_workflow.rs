//! End-to-end ingestion workflow scenarios against HTTP fixtures.

mod common;

use std::time::{Duration, Instant};

use granary::activities::{ActivityError, CollectSource};
use granary::models::{stable_document_id, EMBEDDING_DIM};
use granary::storage::StorageBackend;
use granary::workflow::{DocumentInput, ScheduleInput, WorkflowError};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn happy_path_html_ingest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "<html><head><title>T</title></head><body><p>Hello world</p></body></html>",
            "text/html",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    let url = format!("{}/html", server.uri());
    let outcome = runtime
        .run_document_ingestion("ingest-test-html", DocumentInput::new(&url, "html"))
        .await
        .unwrap();

    assert!(!outcome.commit_hash.as_str().is_empty());
    let expected_id = stable_document_id(&url);
    assert_eq!(outcome.document_id, expected_id);
    assert_eq!(outcome.branch, format!("ingest/{expected_id}"));

    let document = store.get_document(&outcome.document_id).await.unwrap();
    assert_eq!(document.content.metadata.get("title").unwrap(), "T");
    assert!(document.content.text.contains("Hello world"));
    assert_eq!(document.content.embeddings.len(), EMBEDDING_DIM);

    // The commit hash resolves on the same store instance.
    let by_hash = store.resolve_commit(&outcome.commit_hash).await.unwrap();
    assert_eq!(by_hash.id, document.id);

    // Merging the already merged branch again is a no-op.
    store.merge_branch(&outcome.branch).await.unwrap();
}

#[tokio::test]
async fn pdf_without_text_fails_permanently_without_retries() {
    let server = MockServer::start().await;
    // Valid magic, no extractable text.
    Mock::given(method("GET"))
        .and(path("/doc.pdf"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("%PDF-1.4\nno text here", "application/pdf"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    let url = format!("{}/doc.pdf", server.uri());
    let err = runtime
        .run_document_ingestion("ingest-test-pdf", DocumentInput::new(&url, "pdf"))
        .await
        .unwrap_err();

    match err {
        WorkflowError::ActivityFailed {
            activity, source, ..
        } => {
            assert_eq!(activity, "extract");
            assert!(matches!(source, ActivityError::ExtractionPermanent(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    // No document landed anywhere.
    let id = stable_document_id(&url);
    assert!(store.get_document(&id).await.is_err());

    // The journal shows a single failed extraction attempt, no retries.
    let journal: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("workflows").join("ingest-test-pdf.json"))
            .unwrap(),
    )
    .unwrap();
    let extract_events: Vec<_> = journal["history"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|event| event["activity"] == "extract")
        .collect();
    assert_eq!(extract_events.len(), 1);
    assert_eq!(journal["status"], "failed");
}

#[tokio::test]
async fn transient_fetch_failures_are_retried_to_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("abc", "text/plain"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    let url = format!("{}/flaky", server.uri());
    let outcome = runtime
        .run_document_ingestion("ingest-test-flaky", DocumentInput::new(&url, "text"))
        .await
        .unwrap();

    let document = store.get_document(&outcome.document_id).await.unwrap();
    assert_eq!(document.content.text, "abc");
}

#[tokio::test]
async fn scheduled_sweep_suppresses_duplicate_ids() {
    let server = MockServer::start().await;
    let item_url = format!("{}/item", server.uri());
    // Two feed items pointing at the same URL yield the same stable id.
    let feed = format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel>
           <title>Feed</title><link>{0}</link><description>d</description>
           <item><title>First</title><link>{1}</link></item>
           <item><title>Again</title><link>{1}</link></item>
           </channel></rss>"#,
        server.uri(),
        item_url
    );
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(feed, "application/rss+xml"))
        .mount(&server)
        .await;
    // Exactly one child ingestion fetches the item.
    Mock::given(method("GET"))
        .and(path("/item"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body><p>Item body</p></body></html>", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    let outcome = runtime
        .run_scheduled_sweep(ScheduleInput {
            name: "fixture-feed".to_string(),
            source_type: "rss".to_string(),
            url: format!("{}/feed", server.uri()),
            schedule: "0 0 * * * *".to_string(),
            filters: Vec::new(),
            metadata: Default::default(),
        })
        .await
        .unwrap();

    assert_eq!(outcome.collected, 2);
    assert_eq!(outcome.started, 1);
    assert_eq!(outcome.duplicates_skipped, 1);
    assert_eq!(outcome.failed, 0);

    // A second sweep finds the persistent seen-set already primed.
    let outcome = runtime
        .run_scheduled_sweep(ScheduleInput {
            name: "fixture-feed".to_string(),
            source_type: "rss".to_string(),
            url: format!("{}/feed", server.uri()),
            schedule: "0 0 * * * *".to_string(),
            filters: Vec::new(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.started, 0);
    assert_eq!(outcome.duplicates_skipped, 2);
}

#[tokio::test]
async fn batch_with_invalid_scheme_aggregates_one_failure() {
    let server = MockServer::start().await;
    for route in ["/a", "/c"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(format!("body of {route}"), "text/plain"),
            )
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    let inputs = vec![
        DocumentInput::new(format!("{}/a", server.uri()), "text"),
        DocumentInput::new("ftp://example.com/blocked", "text"),
        DocumentInput::new(format!("{}/c", server.uri()), "text"),
    ];
    let err = runtime.run_batch(inputs).await.unwrap_err();

    match err {
        WorkflowError::BatchFailed {
            failed,
            total,
            summary,
        } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
            assert!(summary.contains("invalid input") || summary.contains("scheme"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The two valid inputs were ingested and merged.
    for route in ["/a", "/c"] {
        let id = stable_document_id(&format!("{}{route}", server.uri()));
        let document = store.get_document(&id).await.unwrap();
        assert_eq!(document.content.text, format!("body of {route}"));
    }
}

#[tokio::test]
async fn batch_larger_than_concurrency_bound_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("payload", "text/plain"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    // More children than the bound of five.
    let inputs: Vec<DocumentInput> = (0..8)
        .map(|n| DocumentInput::new(format!("{}/doc/{n}", server.uri()), "text"))
        .collect();
    let outcome = runtime.run_batch(inputs).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 8);
}

#[tokio::test]
async fn collector_waits_out_the_required_delay() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"<?xml version="1.0"?><rss version="2.0"><channel>
               <title>F</title><link>http://example.com</link><description>d</description>
               </channel></rss>"#,
            "application/rss+xml",
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());
    let activities = runtime.activities();

    let source = CollectSource::new("polite-feed", "rss", format!("{}/feed", server.uri()));
    let started = Instant::now();
    let collected = activities
        .collect_from_source(&source, &CancellationToken::new())
        .await
        .unwrap();
    assert!(collected.is_empty());

    // The general polite floor is one second; allow scheduler slack.
    assert!(started.elapsed() >= Duration::from_secs(1) - Duration::from_millis(10));
}

#[tokio::test]
async fn workflow_replays_from_journal_without_refetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/once"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("fetched exactly once", "text/plain"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let runtime = common::test_runtime(dir.path(), store.clone());

    let url = format!("{}/once", server.uri());
    let input = DocumentInput::new(&url, "text");
    let first = runtime
        .run_document_ingestion("ingest-replay", input.clone())
        .await
        .unwrap();

    // Same workflow id: every activity replays from the journal; the
    // fetch mock's expect(1) verifies no second request went out.
    let second = runtime
        .run_document_ingestion("ingest-replay", input)
        .await
        .unwrap();
    assert_eq!(first.commit_hash, second.commit_hash);
    assert_eq!(first.document_id, second.document_id);
}
