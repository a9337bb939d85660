//! End-to-end scenarios against an in-process app: the full pipeline from
//! login through revocation, idempotent payments, role changes, rate limits
//! and webhook replay.

use actix_web::middleware::DefaultHeaders;
use actix_web::{test, web, App};
use std::net::SocketAddr;

use trustplane::audit::EventType;
use trustplane::error::StoreError;
use trustplane::webhook::sign_payload;
use trustplane_server::identity::IdentityProvider;
use trustplane_server::{routes, AppState, ServerConfig};

const WEBHOOK_SECRET: &[u8] = b"test-webhook-secret-test-webhook-secret";
const PASSWORD: &str = "correct-horse-battery";

macro_rules! test_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .wrap(
                    DefaultHeaders::new()
                        .add(("X-Content-Type-Options", "nosniff"))
                        .add(("X-Frame-Options", "DENY"))
                        .add(("X-XSS-Protection", "1; mode=block")),
                )
                .configure(routes::configure),
        )
        .await
    };
}

fn state() -> web::Data<AppState> {
    web::Data::new(AppState::build(ServerConfig::for_tests()).unwrap())
}

fn seed_user(state: &AppState, email: &str) -> String {
    match state.identity.as_ref() {
        IdentityProvider::Static(provider) => provider.add_user(email, PASSWORD),
        IdentityProvider::Http(_) => panic!("tests use the static identity provider"),
    }
}

fn peer(ip: &str) -> SocketAddr {
    format!("{ip}:40000").parse().unwrap()
}

fn login_req(email: &str, password: &str, ip: &str) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/auth/login")
        .peer_addr(peer(ip))
        .set_json(serde_json::json!({ "email": email, "password": password }))
}

fn authed_post(uri: &str, token: &str, ip: &str, body: serde_json::Value) -> test::TestRequest {
    test::TestRequest::post()
        .uri(uri)
        .peer_addr(peer(ip))
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(body)
}

fn payments_count(state: &AppState) -> i64 {
    state
        .store
        .with_conn(None, |conn| {
            conn.query_row("SELECT COUNT(*) FROM payments", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
        .unwrap()
}

#[actix_rt::test]
async fn revoked_session_blocks_write() {
    let state = state();
    let app = test_app!(state);
    let user_id = seed_user(&state, "u@example.com");

    let resp = test::call_service(&app, login_req("u@example.com", PASSWORD, "10.0.0.1").to_request()).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = test::read_body_json(resp).await;
    let token = body["access_token"].as_str().unwrap().to_string();

    // Logout everywhere.
    let resp = test::call_service(
        &app,
        authed_post("/auth/logout", &token, "10.0.0.1", serde_json::json!({ "logout_all": true }))
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    // Any authenticated POST with the old token is rejected.
    let resp = test::call_service(
        &app,
        authed_post("/teams", &token, "10.0.0.1", serde_json::json!({ "name": "after-logout" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "SESSION_INVALID");
    assert!(body["request_id"].as_str().is_some());

    // The revoked-session use is in the audit trail, attributable to U.
    let events = state
        .audit
        .find(EventType::SecuritySessionRevoked, None, 10)
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor_id.as_deref(), Some(user_id.as_str()));
    assert!(state.audit.verify_entry(&events[0]));
}

#[actix_rt::test]
async fn idempotent_payment_creation() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "payer@example.com");

    let resp = test::call_service(&app, login_req("payer@example.com", PASSWORD, "10.0.0.2").to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let token = body["access_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post("/teams", &token, "10.0.0.2", serde_json::json!({ "name": "billing" }))
            .to_request(),
    )
    .await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let team_id = body["team_id"].as_str().unwrap().to_string();

    let payment_body = serde_json::json!({
        "team_id": team_id,
        "amount_cents": 2500,
        "currency": "USD",
    });

    let mut payment_ids = Vec::new();
    for _ in 0..2 {
        let resp = test::call_service(
            &app,
            authed_post("/payments", &token, "10.0.0.2", payment_body.clone())
                .insert_header(("Idempotency-Key", "k-001"))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        payment_ids.push(body["id"].as_str().unwrap().to_string());
    }
    assert_eq!(payment_ids[0], payment_ids[1]);

    // Exactly one payments row and one payment.initiated audit row.
    assert_eq!(payments_count(&state), 1);
    let events = state
        .audit
        .find(EventType::PaymentInitiated, Some(payment_ids[0].as_str()), 10)
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[actix_rt::test]
async fn idempotency_conflict_on_changed_amount() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "payer@example.com");

    let resp = test::call_service(&app, login_req("payer@example.com", PASSWORD, "10.0.0.3").to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let token = body["access_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post("/teams", &token, "10.0.0.3", serde_json::json!({ "name": "billing" }))
            .to_request(),
    )
    .await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let team_id = body["team_id"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post(
            "/payments",
            &token,
            "10.0.0.3",
            serde_json::json!({ "team_id": team_id, "amount_cents": 2500, "currency": "USD" }),
        )
        .insert_header(("Idempotency-Key", "k-001"))
        .to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    // Same key, different amount.
    let resp = test::call_service(
        &app,
        authed_post(
            "/payments",
            &token,
            "10.0.0.3",
            serde_json::json!({ "team_id": team_id, "amount_cents": 9999, "currency": "USD" }),
        )
        .insert_header(("Idempotency-Key", "k-001"))
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "IDEMPOTENCY_CONFLICT");

    // No second payment row.
    assert_eq!(payments_count(&state), 1);
}

#[actix_rt::test]
async fn role_change_revokes_sessions() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "owner@example.com");
    let admin_id = seed_user(&state, "admin@example.com");

    let resp = test::call_service(&app, login_req("owner@example.com", PASSWORD, "10.0.0.4").to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let owner_token = body["access_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post("/teams", &owner_token, "10.0.0.4", serde_json::json!({ "name": "core" }))
            .to_request(),
    )
    .await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let team_id = body["team_id"].as_str().unwrap().to_string();

    // Admin joins, then logs in twice (two live sessions).
    let resp = test::call_service(
        &app,
        authed_post(
            &format!("/teams/{team_id}/members"),
            &owner_token,
            "10.0.0.4",
            serde_json::json!({ "user_id": admin_id, "role": "admin" }),
        )
        .to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    let mut admin_tokens = Vec::new();
    for ip in ["10.0.0.5", "10.0.0.6"] {
        let resp = test::call_service(&app, login_req("admin@example.com", PASSWORD, ip).to_request()).await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        admin_tokens.push(body["access_token"].as_str().unwrap().to_string());
    }

    // Owner demotes the admin.
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri(&format!("/teams/{team_id}/members/{admin_id}/role"))
            .peer_addr(peer("10.0.0.4"))
            .insert_header(("Authorization", format!("Bearer {owner_token}")))
            .set_json(serde_json::json!({ "role": "member" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    // Both of the admin's sessions carry the revocation.
    for token in &admin_tokens {
        let session = state.sessions.get_by_token(token).unwrap().unwrap();
        assert!(session.revoked_at.is_some());
        assert_eq!(session.revocation_reason.as_deref(), Some("role_change"));
    }

    // The admin's next request is rejected.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/teams")
            .peer_addr(peer("10.0.0.5"))
            .insert_header(("Authorization", format!("Bearer {}", admin_tokens[0])))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);
}

#[actix_rt::test]
async fn login_rate_limit_triggers() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "u@example.com");

    for _ in 0..10 {
        let resp = test::call_service(&app, login_req("u@example.com", PASSWORD, "10.9.9.9").to_request()).await;
        assert!(resp.status().is_success());
    }

    let resp = test::call_service(&app, login_req("u@example.com", PASSWORD, "10.9.9.9").to_request()).await;
    assert_eq!(resp.status(), 429);

    let retry_after: i64 = resp
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "RATE_LIMITED");

    let events = state
        .audit
        .find(EventType::SecurityRateLimitHit, None, 10)
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[actix_rt::test]
async fn webhook_replay_is_deduplicated() {
    let state = state();
    let app = test_app!(state);

    let now = chrono::Utc::now().timestamp();
    let payload = serde_json::json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "in_123", "metadata": {} } },
    })
    .to_string();
    let signature = sign_payload(WEBHOOK_SECRET, payload.as_bytes(), now);

    let webhook_req = |payload: String, signature: String| {
        test::TestRequest::post()
            .uri("/webhooks/stripe")
            .peer_addr(peer("10.0.0.7"))
            .insert_header(("Stripe-Signature", signature))
            .insert_header(("Content-Type", "application/json"))
            .set_payload(payload)
            .to_request()
    };

    let resp = test::call_service(&app, webhook_req(payload.clone(), signature.clone())).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["received"], true);
    assert!(body.get("duplicate").is_none());
    assert_eq!(state.webhooks.processed_count().unwrap(), 1);

    // Replay: acknowledged, no new row, no state change.
    let resp = test::call_service(&app, webhook_req(payload, signature)).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["duplicate"], true);
    assert_eq!(state.webhooks.processed_count().unwrap(), 1);
}

#[actix_rt::test]
async fn webhook_bad_signature_rejected() {
    let state = state();
    let app = test_app!(state);

    let payload = serde_json::json!({ "id": "evt_1", "type": "x" }).to_string();
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/webhooks/stripe")
            .peer_addr(peer("10.0.0.8"))
            .insert_header(("Stripe-Signature", "t=0,v1=deadbeef"))
            .insert_header(("Content-Type", "application/json"))
            .set_payload(payload)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(state.webhooks.processed_count().unwrap(), 0);
}

#[actix_rt::test]
async fn security_headers_present() {
    let state = state();
    let app = test_app!(state);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/health")
            .peer_addr(peer("10.0.0.9"))
            .to_request(),
    )
    .await;
    assert_eq!(
        resp.headers().get("X-Content-Type-Options").unwrap(),
        "nosniff"
    );
    assert_eq!(resp.headers().get("X-Frame-Options").unwrap(), "DENY");
    assert_eq!(
        resp.headers().get("X-XSS-Protection").unwrap(),
        "1; mode=block"
    );
}

#[actix_rt::test]
async fn non_member_cannot_read_team_payment() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "member@example.com");
    seed_user(&state, "outsider@example.com");

    let resp = test::call_service(&app, login_req("member@example.com", PASSWORD, "10.0.1.1").to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let member_token = body["access_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post("/teams", &member_token, "10.0.1.1", serde_json::json!({ "name": "private" }))
            .to_request(),
    )
    .await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let team_id = body["team_id"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post(
            "/payments",
            &member_token,
            "10.0.1.1",
            serde_json::json!({ "team_id": team_id, "amount_cents": 1000, "currency": "USD" }),
        )
        .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    let payment: serde_json::Value = test::read_body_json(resp).await;
    let payment_id = payment["id"].as_str().unwrap().to_string();

    let resp = test::call_service(&app, login_req("outsider@example.com", PASSWORD, "10.0.1.2").to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let outsider_token = body["access_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/payments/{payment_id}"))
            .peer_addr(peer("10.0.1.2"))
            .insert_header(("Authorization", format!("Bearer {outsider_token}")))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TEAM_ACCESS_DENIED");

    // The denial is audited.
    let events = state
        .audit
        .find(EventType::AuthzAccessDenied, Some(team_id.as_str()), 10)
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[actix_rt::test]
async fn payment_listing_rejects_tampered_cursor() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "member@example.com");

    let resp = test::call_service(&app, login_req("member@example.com", PASSWORD, "10.0.3.1").to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let token = body["access_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        authed_post("/teams", &token, "10.0.3.1", serde_json::json!({ "name": "billing" }))
            .to_request(),
    )
    .await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    let team_id = body["team_id"].as_str().unwrap().to_string();

    for i in 0..3 {
        let resp = test::call_service(
            &app,
            authed_post(
                "/payments",
                &token,
                "10.0.3.1",
                serde_json::json!({ "team_id": team_id, "amount_cents": 100 + i, "currency": "USD" }),
            )
            .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
    }

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/teams/{team_id}/payments"))
            .peer_addr(peer("10.0.3.1"))
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["payments"].as_array().unwrap().len(), 3);
    // Fewer rows than a page: no continuation cursor.
    assert!(body["next_cursor"].is_null());

    // A forged cursor is rejected outright.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!(
                "/teams/{team_id}/payments?cursor=eyJvZmZzZXQiOjB9"
            ))
            .peer_addr(peer("10.0.3.1"))
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[actix_rt::test]
async fn account_lockout_after_failed_logins() {
    let state = state();
    let app = test_app!(state);
    seed_user(&state, "u@example.com");

    for _ in 0..5 {
        let resp =
            test::call_service(&app, login_req("u@example.com", "wrong-password", "10.0.2.1").to_request()).await;
        assert!(resp.status() == 401 || resp.status() == 423);
    }

    // Locked now, even with the correct password.
    let resp = test::call_service(&app, login_req("u@example.com", PASSWORD, "10.0.2.1").to_request()).await;
    assert_eq!(resp.status(), 423);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ACCOUNT_LOCKED");
}
