//! Health, readiness and liveness probes.

use actix_web::{get, web, HttpResponse};

use trustplane::circuit::CircuitState;

use crate::state::AppState;

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let mut healthy = true;
    let mut checks = serde_json::Map::new();

    let store = state.store.health_check();
    if !store.is_healthy {
        healthy = false;
    }
    checks.insert(
        "database".to_string(),
        serde_json::json!({
            "healthy": store.is_healthy,
            "latency_ms": store.latency_ms,
        }),
    );

    // The counter store fails open; sustained failures degrade health so
    // operators notice before the limiter becomes decorative.
    let limiter_failures = state.limiter.store_failures();
    checks.insert(
        "rate_limit_store".to_string(),
        serde_json::json!({
            "healthy": true,
            "store_failures": limiter_failures,
        }),
    );

    for (name, circuit_state) in state.circuits.states() {
        let circuit_healthy = circuit_state != CircuitState::Open;
        if !circuit_healthy {
            healthy = false;
        }
        checks.insert(
            format!("circuit_{name}"),
            serde_json::json!({
                "healthy": circuit_healthy,
                "state": circuit_state.as_str(),
            }),
        );
    }

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "checks": checks,
    });
    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[get("/ready")]
pub async fn ready() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "ready": true }))
}

#[get("/live")]
pub async fn live() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "alive": true }))
}
