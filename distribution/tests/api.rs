use axum::Router;
use axum::body::Body;
use distribution::acquisition::Acquisition;
use distribution::aggregator::MetricsAggregator;
use distribution::api::{AppState, USER_HEADER, router};
use distribution::blob::{BlobStore, MemoryBlobStore, UrlSigner};
use distribution::cache::MemoryResponseCache;
use distribution::lifecycle::ReleaseManager;
use distribution::registry::Registry;
use distribution::store::MemoryStore;
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

struct TestApp {
    router: Router,
    aggregator: MetricsAggregator,
}

fn test_app() -> TestApp {
    let memory = Arc::new(MemoryStore::new());
    let signer = UrlSigner::new(
        Url::parse("http://ota.test/").unwrap(),
        b"test-signing-key",
        Duration::from_secs(300),
    )
    .unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new(signer));
    let cache = Arc::new(MemoryResponseCache::new(100, Duration::from_secs(60)));
    let aggregator = MetricsAggregator::new(memory.clone(), Duration::from_secs(3600), 1000);

    let state = AppState {
        registry: Arc::new(Registry::new(memory.clone(), cache.clone())),
        releases: Arc::new(ReleaseManager::new(
            memory.clone(),
            blobs.clone(),
            cache.clone(),
            50,
        )),
        acquisition: Arc::new(Acquisition::new(
            memory,
            blobs.clone(),
            cache,
            aggregator.clone(),
        )),
        blobs,
    };

    TestApp {
        router: router(state, 1024 * 1024),
        aggregator,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = match bytes.is_empty() {
            true => Value::Null,
            false => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
        };
        (status, body)
    }

    async fn manage(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(format!("/v0.1/management{path}"))
            .header(USER_HEADER, "alice");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Creates an app with one iOS deployment and returns its key.
    async fn deployment(&self) -> String {
        let (status, app) = self
            .manage(Method::POST, "/apps", Some(json!({"name": "app"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, deployment) = self
            .manage(
                Method::POST,
                &format!("/apps/{}/deployments", app["id"]),
                Some(json!({"platform": "ios", "name": "Production"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        deployment["key"].as_str().unwrap().to_string()
    }

    /// Stages, uploads and verifies a bundle through the API.
    async fn release(&self, key: &str, hash: &str, bundle: &'static [u8]) {
        let (status, staged) = self
            .manage(
                Method::POST,
                &format!("/deployments/{key}/releases"),
                Some(json!({"app_version": "1.0.0", "package_hash": hash})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let upload_url = Url::parse(staged["upload_url"].as_str().unwrap()).unwrap();
        let request = Request::put(path_and_query(&upload_url))
            .body(Body::from(bundle))
            .unwrap();
        let (status, _) = self.send(request).await;
        assert_eq!(status, StatusCode::OK);

        let (status, release) = self
            .manage(
                Method::POST,
                &format!("/deployments/{key}/releases/{}/verify", staged["release_id"]),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(release["is_verified"], true);
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

#[tokio::test]
async fn release_and_update_check() {
    let app = test_app();
    let key = app.deployment().await;
    app.release(&key, "H1", b"bundle-one").await;

    let (status, body) = app
        .get(&format!(
            "/v0.1/public/codepush/update_check?deployment_key={key}&app_version=1.0&client_unique_id=c1"
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let info = &body["updateInfo"];
    assert_eq!(info["isAvailable"], true);
    assert_eq!(info["label"], "v1");
    assert_eq!(info["packageHash"], "H1");
    assert_eq!(info["appVersion"], "1.0");
    assert_eq!(info["packageSize"], 10);

    // The download URL points back at this service.
    let download = Url::parse(info["downloadURL"].as_str().unwrap()).unwrap();
    assert_eq!(download.host_str(), Some("ota.test"));
    let response = app
        .router
        .clone()
        .oneshot(Request::get(download.path()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"bundle-one");

    let (status, body) = app
        .get(&format!(
            "/v0.1/public/codepush/update_check?deployment_key={key}&app_version=1.0.0&label=v1"
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updateInfo"]["isAvailable"], false);
}

#[tokio::test]
async fn unknown_deployment_key() {
    let app = test_app();
    let (status, body) = app
        .get("/v0.1/public/codepush/update_check?deployment_key=missing&app_version=1.0.0")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_message"], "deployment not found");
}

#[tokio::test]
async fn status_reports_are_queued() {
    let app = test_app();
    let key = app.deployment().await;

    let (status, _) = app
        .post_json(
            "/v0.1/public/codepush/report_status/deploy",
            json!({"deployment_key": key, "app_version": "1.0.0", "label": "v1"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json(
            "/v0.1/public/codepush/report_status/deploy",
            json!({
                "deployment_key": key,
                "app_version": "1.0.0",
                "label": "v1",
                "status": "DeploymentSucceeded",
                "client_unique_id": "c1",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .post_json(
            "/v0.1/public/codepush/report_status/download",
            json!({"deployment_key": key, "label": "v1", "client_unique_id": "c1"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.aggregator.pending(), 3);
}

#[tokio::test]
async fn uploads_need_a_valid_signature() {
    let app = test_app();
    let key = app.deployment().await;
    let (_, staged) = app
        .manage(
            Method::POST,
            &format!("/deployments/{key}/releases"),
            Some(json!({"app_version": "1.0.0", "package_hash": "H1"})),
        )
        .await;
    let mut upload_url = Url::parse(staged["upload_url"].as_str().unwrap()).unwrap();
    let expires = upload_url
        .query_pairs()
        .find(|(name, _)| name == "expires")
        .map(|(_, value)| value.into_owned())
        .unwrap();
    upload_url
        .query_pairs_mut()
        .clear()
        .append_pair("expires", &expires)
        .append_pair("signature", "00");

    let request = Request::put(path_and_query(&upload_url))
        .body(Body::from("bundle"))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn uploaded_bundles_cannot_be_replaced() {
    let app = test_app();
    let key = app.deployment().await;
    let (_, staged) = app
        .manage(
            Method::POST,
            &format!("/deployments/{key}/releases"),
            Some(json!({"app_version": "1.0.0", "package_hash": "H1"})),
        )
        .await;
    let upload = path_and_query(&Url::parse(staged["upload_url"].as_str().unwrap()).unwrap());

    let request = Request::put(upload.as_str()).body(Body::from("bundle")).unwrap();
    assert_eq!(app.send(request).await.0, StatusCode::OK);
    let (status, _) = app
        .manage(
            Method::POST,
            &format!("/deployments/{key}/releases/{}/verify", staged["release_id"]),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::put(upload.as_str()).body(Body::from("evil")).unwrap();
    assert_eq!(app.send(request).await.0, StatusCode::CONFLICT);

    let blob = format!("/blobs/{}", staged["blob_key"].as_str().unwrap());
    let response = app
        .router
        .clone()
        .oneshot(Request::get(blob.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"bundle");
}

#[tokio::test]
async fn management_requires_a_user() {
    let app = test_app();
    let request = Request::post("/v0.1/management/apps")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"name": "app"}"#))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn release_management_flow() {
    let app = test_app();
    let key = app.deployment().await;
    app.release(&key, "H1", b"one").await;
    app.release(&key, "H2", b"two").await;

    // Patching nothing is reported as not modified.
    let (status, _) = app
        .manage(
            Method::PATCH,
            &format!("/deployments/{key}/releases"),
            Some(json!({"is_mandatory": false})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, release) = app
        .manage(
            Method::PATCH,
            &format!("/deployments/{key}/releases"),
            Some(json!({"label": "v2", "description": "hotfix"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(release["description"], "hotfix");

    let (status, release) = app
        .manage(Method::POST, &format!("/deployments/{key}/rollback"), None)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(release["label"], "v3");
    assert_eq!(release["package_hash"], "H1");
    assert_eq!(release["release_method"], "rollback");

    let (status, _) = app
        .manage(Method::POST, &format!("/deployments/{key}/rollback/v3"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, history) = app
        .manage(Method::GET, &format!("/deployments/{key}/releases"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 3);

    let (status, metrics) = app
        .manage(Method::GET, &format!("/deployments/{key}/metrics"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics[0]["label"], "v3");
    assert_eq!(metrics[0]["active"], 0);

    let (status, _) = app
        .manage(Method::DELETE, &format!("/deployments/{key}/releases/v2"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .manage(Method::DELETE, &format!("/deployments/{key}/releases"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, history) = app
        .manage(Method::GET, &format!("/deployments/{key}/releases"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history, json!([]));
}
