//! End-to-end tests of the export API over HTTP, backed by in-memory
//! storage and the wall clock.

use std::sync::Arc;

use bulkport_core::{JobArtifact, JobId, JobStatus, NewJob};
use bulkport_db_memory::{InMemoryJobStore, InMemoryWorkQueue};
use bulkport_server::config::{StaticToken, Tier};
use bulkport_server::export::ClockWatermark;
use bulkport_server::{AppConfig, AppState, build_app};
use bulkport_storage::JobStore;
use reqwest::StatusCode;
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const TOKEN: &str = "token-a";
const OTHER_TOKEN: &str = "token-b";

struct TestServer {
    base: String,
    store: InMemoryJobStore,
    queue: InMemoryWorkQueue,
    payload: TempDir,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

fn config(tier: Tier, payload: &TempDir) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.export.tier = tier;
    cfg.export.payload_dir = payload.path().to_path_buf();
    cfg.auth.tokens = vec![
        StaticToken {
            token: TOKEN.into(),
            tenant_id: "tenant-a".into(),
            user_id: None,
        },
        StaticToken {
            token: OTHER_TOKEN.into(),
            tenant_id: "tenant-b".into(),
            user_id: None,
        },
    ];
    cfg
}

async fn start_server(tier: Tier) -> TestServer {
    let payload = TempDir::new().unwrap();
    let store = InMemoryJobStore::new();
    let queue = InMemoryWorkQueue::new();
    let state = AppState::new(
        config(tier, &payload),
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
        Arc::new(ClockWatermark),
    );
    let app = build_app(state);

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        store,
        queue,
        payload,
        shutdown: tx,
        handle,
    }
}

fn export_request(client: &reqwest::Client, url: String) -> reqwest::RequestBuilder {
    client
        .get(url)
        .bearer_auth(TOKEN)
        .header("accept", "application/fhir+json")
        .header("prefer", "respond-async")
}

fn job_id_from_location(location: &str) -> JobId {
    location.rsplit('/').next().unwrap().parse().unwrap()
}

async fn seed_completed(server: &TestServer) -> JobId {
    let mut job = NewJob::new(
        "tenant-a",
        format!("{}/api/v1/Patient/$export", server.base),
    )
    .into_job();
    job.status = JobStatus::Completed;
    job.published = true;
    job.job_count = Some(1);
    job.completed_job_count = 1;
    job.transaction_time = Some(job.created_at);
    server.store.insert_job(job.clone()).await;

    server
        .store
        .add_artifact(JobArtifact::new(job.id, "Patient", "Patient.ndjson"))
        .await
        .unwrap();
    let dir = server.payload.path().join(job.id.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("Patient.ndjson"), "{\"resourceType\":\"Patient\"}\n").unwrap();
    std::fs::write(
        dir.join("Patient-error.ndjson"),
        "{\"resourceType\":\"OperationOutcome\"}\n",
    )
    .unwrap();
    job.id
}

#[tokio::test]
async fn health_endpoints_are_public() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(format!("{}/readyz", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    server.stop().await;
}

#[tokio::test]
async fn export_is_accepted_with_content_location() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();

    let resp = export_request(
        &client,
        format!("{}/api/v1/Patient/$export?_type=Patient,Coverage", server.base),
    )
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let location = resp
        .headers()
        .get("content-location")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(location.starts_with(&format!("{}/api/v1/jobs/", server.base)));

    let id = job_id_from_location(&location);
    let job = server.store.get_job(id).await.unwrap().unwrap();
    assert!(job.published);
    assert_eq!(job.tenant_id, "tenant-a");
    assert!(job.request_url.ends_with("/api/v1/Patient/$export?_type=Patient,Coverage"));
    assert_eq!(server.queue.items_for(id).await.len(), 2);

    // Freshly admitted jobs report progress
    let resp = client
        .get(&location)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(
        resp.headers().get("x-progress").unwrap().to_str().unwrap(),
        "Pending"
    );

    server.stop().await;
}

#[tokio::test]
async fn group_export_resolves_kind() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();

    let resp = export_request(&client, format!("{}/api/v2/Group/runout/$export", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = export_request(&client, format!("{}/api/v2/Group/other/$export", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["resourceType"], "OperationOutcome");

    server.stop().await;
}

#[tokio::test]
async fn export_rejects_bad_headers_and_parameters() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/Patient/$export", server.base);

    let resp = client
        .get(&url)
        .bearer_auth(TOKEN)
        .header("accept", "application/fhir+json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["issue"][0]["diagnostics"],
        "The Prefer header is required and must be set to respond-async"
    );

    let resp = export_request(&client, format!("{url}?_type=Unicorn"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = export_request(&client, format!("{url}?_elements=id"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = export_request(
        &client,
        format!("{}/api/v9/Patient/$export", server.base),
    )
    .send()
    .await
    .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert_eq!(server.store.job_count().await, 0);
    server.stop().await;
}

#[tokio::test]
async fn export_requires_a_known_token() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/Patient/$export", server.base);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(&url)
        .bearer_auth("nope")
        .header("accept", "application/fhir+json")
        .header("prefer", "respond-async")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["resourceType"], "OperationOutcome");

    server.stop().await;
}

#[tokio::test]
async fn duplicate_export_is_throttled_outside_local() {
    let server = start_server(Tier::Prod).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/Patient/$export?_type=Patient", server.base);

    let resp = export_request(&client, url.clone()).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = export_request(&client, url.clone()).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        resp.headers().get("retry-after").unwrap().to_str().unwrap(),
        "1"
    );

    // Another tenant is unaffected
    let resp = client
        .get(&url)
        .bearer_auth(OTHER_TOKEN)
        .header("accept", "application/fhir+json")
        .header("prefer", "respond-async")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    assert_eq!(server.store.job_count().await, 2);
    server.stop().await;
}

#[tokio::test]
async fn completed_job_serves_manifest_and_files() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();
    let id = seed_completed(&server).await;

    let resp = client
        .get(format!("{}/api/v1/jobs/{id}", server.base))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("expires"));
    let manifest: Value = resp.json().await.unwrap();
    assert_eq!(manifest["requiresAccessToken"], true);
    assert_eq!(manifest["jobID"], id.to_string());
    let file_url = format!("{}/data/{id}/Patient.ndjson", server.base);
    assert_eq!(manifest["output"][0]["type"], "Patient");
    assert_eq!(manifest["output"][0]["url"], file_url);
    assert_eq!(manifest["error"][0]["type"], "OperationOutcome");

    let resp = client.get(&file_url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/fhir+ndjson"
    );
    assert_eq!(resp.text().await.unwrap(), "{\"resourceType\":\"Patient\"}\n");

    // Other tenants cannot see the job or its files
    let resp = client
        .get(format!("{}/api/v1/jobs/{id}", server.base))
        .bearer_auth(OTHER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = client
        .get(&file_url)
        .bearer_auth(OTHER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn cancel_then_poll_reports_cancelled() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();

    let resp = export_request(&client, format!("{}/api/v1/Patient/$export", server.base))
        .send()
        .await
        .unwrap();
    let location = resp
        .headers()
        .get("content-location")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let id = job_id_from_location(&location);
    assert!(!server.queue.items_for(id).await.is_empty());

    let resp = client
        .delete(&location)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert!(server.queue.items_for(id).await.is_empty());

    let resp = client
        .get(&location)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["issue"][0]["diagnostics"], "Job has been cancelled.");

    // A second cancel finds nothing left to cancel
    let resp = client
        .delete(&location)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::GONE);

    server.stop().await;
}

#[tokio::test]
async fn unknown_and_malformed_job_ids_are_not_found() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();

    for id in [JobId::new().to_string(), "not-a-uuid".to_string()] {
        let resp = client
            .get(format!("{}/api/v1/jobs/{id}", server.base))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    server.stop().await;
}

#[tokio::test]
async fn job_listing_is_scoped_to_the_tenant_and_filterable() {
    let server = start_server(Tier::Local).await;
    let client = reqwest::Client::new();
    let jobs_url = format!("{}/api/v1/jobs", server.base);

    let resp = client.get(&jobs_url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let completed = seed_completed(&server).await;
    let resp = export_request(&client, format!("{}/api/v1/Patient/$export", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = client.get(&jobs_url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bundle: Value = resp.json().await.unwrap();
    assert_eq!(bundle["resourceType"], "Bundle");
    assert_eq!(bundle["type"], "searchset");
    assert_eq!(bundle["total"], 2);

    let resp = client
        .get(format!("{jobs_url}?_status=Completed"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bundle: Value = resp.json().await.unwrap();
    assert_eq!(bundle["total"], 1);
    let task = &bundle["entry"][0]["resource"];
    assert_eq!(task["identifier"][0]["value"], completed.to_string());
    assert_eq!(task["identifier"][0]["system"], jobs_url.as_str());
    assert_eq!(task["status"], "completed");

    let resp = client
        .get(format!("{jobs_url}?_status=Shipped"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // tenant-b has no jobs of its own
    let resp = client
        .get(&jobs_url)
        .bearer_auth(OTHER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client.get(&jobs_url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    server.stop().await;
}
