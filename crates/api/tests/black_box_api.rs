use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;

use lumagen_api::app::{build_router, services, AppServices};
use lumagen_api::auth::JwtClaims;
use lumagen_api::config::Config;
use lumagen_core::{ProviderTaskId, UserId};
use lumagen_credits::{CreditLedger, EntryType, InMemoryCreditLedger};
use lumagen_gateway::{MockProvider, ProviderRouter, TaskObservation};
use lumagen_jobs::InMemoryJobStore;

const JWT_SECRET: &str = "test-secret";
const CALLBACK_SECRET: &str = "test-callback-secret";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    mock: Arc<MockProvider>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Same router as prod, in-memory stores, scripted provider, ephemeral
    /// port.
    async fn spawn() -> Self {
        let mock = Arc::new(MockProvider::new("mock"));
        let mut router = ProviderRouter::new();
        for kind in [
            lumagen_core::JobKind::Photo,
            lumagen_core::JobKind::Video,
            lumagen_core::JobKind::Audio,
        ] {
            router = router.with_gateway(kind, mock.clone());
        }

        let app_services = Arc::new(services::build_with_router(
            Config::for_tests(JWT_SECRET),
            InMemoryJobStore::arc(),
            InMemoryCreditLedger::arc(),
            router,
        ));

        let app = build_router(app_services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services: app_services,
            mock,
            handle,
        }
    }

    async fn grant(&self, user: UserId, amount: i64) {
        self.services
            .ledger
            .grant(user, amount, EntryType::Bonus, "test balance")
            .await
            .unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(user: UserId, roles: Vec<String>) -> String {
    let claims = JwtClaims::new(user, roles, Utc::now(), chrono::Duration::minutes(10));
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn user_token(user: UserId) -> String {
    mint_jwt(user, vec![])
}

#[tokio::test]
async fn submit_poll_success_flow() {
    let server = TestServer::spawn().await;
    let user = UserId::new();
    let token = user_token(user);
    server.grant(user, 100).await;

    server
        .mock
        .enqueue_submit(Ok(ProviderTaskId::new("task_ok")));
    server.mock.script_poll(
        "task_ok",
        [
            TaskObservation::processing(),
            TaskObservation::success(vec![
                "https://cdn.example/a.png".into(),
                "https://cdn.example/b.png".into(),
            ]),
        ],
    );

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/api/generate", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "kind": "photo", "model": "test/model", "prompt": "a red door" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    assert_eq!(created["status"], "queued");
    assert_eq!(created["creditsCharged"], 5);
    let job_id = created["id"].as_str().unwrap().to_string();

    // First status read observes processing, second observes success.
    let res = client
        .get(format!("{}/api/jobs/{}", server.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["status"], "processing");

    let res = client
        .get(format!("{}/api/jobs/{}", server.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["status"], "success");
    assert_eq!(status["progress"], 100);
    assert_eq!(status["resultUrls"].as_array().unwrap().len(), 2);
    assert_eq!(status["resultUrl"], "https://cdn.example/a.png");

    // Credits stay debited on success; the ledger shows exactly one debit.
    let res = client
        .get(format!("{}/api/credits/balance", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let balance: serde_json::Value = res.json().await.unwrap();
    assert_eq!(balance["balance"], 95);

    let res = client
        .get(format!("{}/api/credits/transactions", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let transactions: serde_json::Value = res.json().await.unwrap();
    let types: Vec<_> = transactions["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap().to_string())
        .collect();
    assert!(types.contains(&"debit".to_string()));
    assert!(!types.contains(&"refund".to_string()));
}

#[tokio::test]
async fn failed_generation_refunds_credits() {
    let server = TestServer::spawn().await;
    let user = UserId::new();
    let token = user_token(user);
    server.grant(user, 100).await;

    server
        .mock
        .enqueue_submit(Ok(ProviderTaskId::new("task_fail")));
    server.mock.script_poll(
        "task_fail",
        [
            TaskObservation::processing(),
            TaskObservation::failed("content policy rejection"),
        ],
    );

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/api/generate", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "kind": "photo", "model": "test/model", "prompt": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    let job_id = created["id"].as_str().unwrap().to_string();

    // Two polls: processing, then the terminal failure.
    for _ in 0..2 {
        client
            .get(format!("{}/api/jobs/{}", server.base_url, job_id))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
    }

    let res = client
        .get(format!("{}/api/jobs/{}", server.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["status"], "failed");
    assert_eq!(status["error"], "content policy rejection");

    // Balance restored to the pre-debit value; exactly one refund entry.
    let res = client
        .get(format!("{}/api/credits/balance", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let balance: serde_json::Value = res.json().await.unwrap();
    assert_eq!(balance["balance"], 100);

    let res = client
        .get(format!("{}/api/credits/transactions", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let transactions: serde_json::Value = res.json().await.unwrap();
    let refunds = transactions["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["type"] == "refund")
        .count();
    assert_eq!(refunds, 1);
}

#[tokio::test]
async fn insufficient_credits_block_submission() {
    let server = TestServer::spawn().await;
    let user = UserId::new();
    let token = user_token(user);
    // No grant: the balance is zero.

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/api/generate", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "kind": "video", "model": "test/model", "prompt": "x" }))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "insufficient_credits");
    assert_eq!(body["required"], 60);
    assert_eq!(body["available"], 0);
    // The provider was never called.
    assert_eq!(server.mock.submit_calls(), 0);
}

#[tokio::test]
async fn webhook_finalizes_job_with_secret() {
    let server = TestServer::spawn().await;
    let user = UserId::new();
    let token = user_token(user);
    server.grant(user, 100).await;

    server
        .mock
        .enqueue_submit(Ok(ProviderTaskId::new("task_hook")));
    server
        .mock
        .script_poll("task_hook", [TaskObservation::processing()]);

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/api/generate", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "kind": "photo", "model": "test/model", "prompt": "x" }))
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = res.json().await.unwrap();
    let job_id = created["id"].as_str().unwrap().to_string();

    // Wrong secret is rejected before touching anything.
    let res = client
        .post(format!("{}/api/webhooks/provider", server.base_url))
        .bearer_auth("wrong-secret")
        .json(&json!({ "data": { "taskId": "task_hook", "state": "success" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Vendor-shaped callback: nested data object, result URLs inline.
    let res = client
        .post(format!(
            "{}/api/webhooks/provider?secret={}",
            server.base_url, CALLBACK_SECRET
        ))
        .json(&json!({
            "code": 200,
            "data": {
                "taskId": "task_hook",
                "state": "success",
                "resultUrls": ["https://cdn.example/hook.png"]
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);

    let res = client
        .get(format!("{}/api/jobs/{}", server.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["status"], "success");
    assert_eq!(status["resultUrls"][0], "https://cdn.example/hook.png");

    // A late duplicate callback is acknowledged and changes nothing.
    let res = client
        .post(format!(
            "{}/api/webhooks/provider?secret={}",
            server.base_url, CALLBACK_SECRET
        ))
        .json(&json!({
            "data": { "taskId": "task_hook", "state": "success",
                      "resultUrls": ["https://cdn.example/other.png"] }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!("{}/api/jobs/{}", server.base_url, job_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["resultUrls"][0], "https://cdn.example/hook.png");
}

#[tokio::test]
async fn auth_and_admin_boundaries() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Health is public.
    let res = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Everything else requires a token.
    let res = client
        .get(format!("{}/api/credits/balance", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Admin routes require the admin role.
    let user = UserId::new();
    let res = client
        .post(format!("{}/api/admin/credits/grant", server.base_url))
        .bearer_auth(user_token(user))
        .json(&json!({ "user_id": user, "amount": 50 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let admin = UserId::new();
    let res = client
        .post(format!("{}/api/admin/credits/grant", server.base_url))
        .bearer_auth(mint_jwt(admin, vec!["admin".into()]))
        .json(&json!({ "user_id": user, "amount": 50 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!("{}/api/credits/balance", server.base_url))
        .bearer_auth(user_token(user))
        .send()
        .await
        .unwrap();
    let balance: serde_json::Value = res.json().await.unwrap();
    assert_eq!(balance["balance"], 50);

    // Circuit inspection responds for admins.
    let res = client
        .get(format!("{}/api/admin/circuits", server.base_url))
        .bearer_auth(mint_jwt(admin, vec!["admin".into()]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn jobs_are_private_to_their_owner() {
    let server = TestServer::spawn().await;
    let owner = UserId::new();
    server.grant(owner, 100).await;

    server
        .mock
        .enqueue_submit(Ok(ProviderTaskId::new("task_priv")));
    server
        .mock
        .script_poll("task_priv", [TaskObservation::processing()]);

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/api/generate", server.base_url))
        .bearer_auth(user_token(owner))
        .json(&json!({ "kind": "photo", "model": "test/model", "prompt": "x" }))
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = res.json().await.unwrap();
    let job_id = created["id"].as_str().unwrap().to_string();

    let stranger = UserId::new();
    let res = client
        .get(format!("{}/api/jobs/{}", server.base_url, job_id))
        .bearer_auth(user_token(stranger))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
