use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::forge::{ForgeBackend, ForgeError};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub token: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// One user lookup answers both questions: is the host reachable, and does
/// it accept the token.
async fn run_checks(session: &Session, forge: &dyn ForgeBackend) -> HealthChecks {
    let fingerprint = session.fingerprint();
    match forge.authenticated_user().await {
        Ok(user) => HealthChecks {
            token: CheckResult::healthy(format!("token {fingerprint} authenticated as {}", user.login)),
            upstream: CheckResult::healthy("reachable"),
        },
        Err(ForgeError::Unauthorized(msg)) => HealthChecks {
            token: CheckResult::unhealthy(format!("token {fingerprint} rejected: {msg}")),
            upstream: CheckResult::healthy("reachable"),
        },
        Err(e) => HealthChecks {
            token: CheckResult::healthy(format!("token {fingerprint} not verified")),
            upstream: CheckResult::unhealthy(format!("user lookup failed: {e}")),
        },
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.token.ok {
        // Nothing works with a rejected token.
        HealthStatus::Unhealthy
    } else if !checks.upstream.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Handler body
// ---------------------------------------------------------------------------

/// Body of `GET /healthz`.  200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health(session: &Session, forge: &dyn ForgeBackend) -> (StatusCode, Json<HealthResponse>) {
    let checks = run_checks(session, forge).await;
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
