//! Organization-scoped route handlers.
//!
//! Every handler parses the `:org` path segment into an [`OrganizationId`]
//! and passes it to the secure data client or the credential vault.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use marketops_core::{
    doc, ApiEnvelope, Document, Error, HttpMethod, OrganizationId, RequestBody, StatusResponse, UpdateResult,
    ID_FIELD,
};
use marketops_governance::{ConnectedIntegration, OAuthTokens, UsageSnapshot};
use marketops_resilience::{BreakerSnapshot, Platform};

use crate::error::ApiError;
use crate::server::AppState;

pub const CAMPAIGNS_COLLECTION: &str = "campaigns";
const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 500;

type ApiResult<T> = std::result::Result<T, ApiError>;

fn envelope<T: Serialize>(data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope::new(Uuid::new_v4().to_string(), data))
}

fn scope(raw: &str) -> marketops_core::Result<OrganizationId> {
    OrganizationId::parse(Some(raw))
}

// =============================================================================
// Usage
// =============================================================================

pub async fn usage(
    State(state): State<Arc<AppState>>,
    Path(org): Path<String>,
) -> ApiResult<Json<ApiEnvelope<UsageSnapshot>>> {
    let org = scope(&org)?;
    Ok(envelope(state.guardrail.usage_snapshot(org.as_str())))
}

/// Consumption reported after a billable operation.
#[derive(Debug, Deserialize)]
pub struct UsageReport {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

pub async fn report_usage(
    State(state): State<Arc<AppState>>,
    Path(org): Path<String>,
    Json(report): Json<UsageReport>,
) -> ApiResult<Json<ApiEnvelope<UsageSnapshot>>> {
    let org = scope(&org)?;
    if report.tokens > 0 {
        state.guardrail.enforce_tokens(org.as_str(), report.tokens)?;
    }
    if let Some(cost) = report.cost_usd {
        state.guardrail.enforce_cost(cost)?;
    }
    Ok(envelope(state.guardrail.usage_snapshot(org.as_str())))
}

// =============================================================================
// Integrations
// =============================================================================

#[derive(Debug, Serialize)]
pub struct IntegrationStatus {
    pub platform: Platform,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectedIntegration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<BreakerSnapshot>,
}

pub async fn list_integrations(
    State(state): State<Arc<AppState>>,
    Path(org): Path<String>,
) -> ApiResult<Json<ApiEnvelope<Vec<IntegrationStatus>>>> {
    let org = scope(&org)?;
    let connected = state.vault.connected(&org).await?;
    let circuits = state.platforms.breaker_states();

    let statuses = Platform::ALL
        .into_iter()
        .map(|platform| {
            let connection = connected.iter().find(|c| c.platform == platform).cloned();
            IntegrationStatus {
                platform,
                connected: connection.is_some(),
                connection,
                circuit: circuits.iter().find(|c| c.name == platform.slug()).cloned(),
            }
        })
        .collect();
    Ok(envelope(statuses))
}

pub async fn connect_integration(
    State(state): State<Arc<AppState>>,
    Path((org, platform)): Path<(String, String)>,
    Json(tokens): Json<OAuthTokens>,
) -> ApiResult<StatusCode> {
    let org = scope(&org)?;
    let platform: Platform = platform.parse()?;
    state.vault.store(&org, platform, &tokens).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn disconnect_integration(
    State(state): State<Arc<AppState>>,
    Path((org, platform)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let org = scope(&org)?;
    let platform: Platform = platform.parse()?;
    if state.vault.disconnect(&org, platform).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("{} is not connected", platform)).into())
    }
}

/// Call forwarded to a connected platform with the organization's token.
#[derive(Debug, Deserialize)]
pub struct PlatformCall {
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct PlatformReply {
    pub platform: Platform,
    pub status: u16,
    pub body: Value,
}

pub async fn platform_request(
    State(state): State<Arc<AppState>>,
    Path((org, platform)): Path<(String, String)>,
    Json(call): Json<PlatformCall>,
) -> ApiResult<Json<ApiEnvelope<PlatformReply>>> {
    let org = scope(&org)?;
    let platform: Platform = platform.parse()?;

    let tokens = state
        .vault
        .load(&org, platform)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{} is not connected", platform)))?;
    if tokens.is_expired(Utc::now()) {
        return Err(Error::invalid_request(format!("{} access token has expired; reconnect", platform)).into());
    }

    let client = state.platforms.client(platform)?;
    let authorization = format!("Bearer {}", tokens.access_token.expose_secret());
    let params: Vec<(&str, &str)> = call.query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let body = call.body.map_or(RequestBody::Empty, RequestBody::Json);

    let response = client
        .request(
            call.method,
            &call.endpoint,
            &params,
            body,
            &[("Authorization", authorization.as_str())],
        )
        .await?;

    Ok(envelope(PlatformReply {
        platform,
        status: response.status(),
        body: response.json::<Value>().unwrap_or_else(|_| Value::String(response.text())),
    }))
}

// =============================================================================
// Campaigns
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub filter: Document,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Path(org): Path<String>,
    Json(campaign): Json<Document>,
) -> ApiResult<Response> {
    let org = scope(&org)?;
    let id = state
        .data
        .insert_one_secure(CAMPAIGNS_COLLECTION, campaign, &org)
        .await?;
    tracing::info!(organization = %org, campaign_id = %id, "Campaign created");
    Ok((StatusCode::CREATED, envelope(json!({ "id": id }))).into_response())
}

pub async fn search_campaigns(
    State(state): State<Arc<AppState>>,
    Path(org): Path<String>,
    Json(search): Json<SearchRequest>,
) -> ApiResult<Json<ApiEnvelope<Vec<Document>>>> {
    let org = scope(&org)?;
    let limit = search.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let found = state
        .data
        .find_secure(CAMPAIGNS_COLLECTION, &search.filter, &org, Some(limit))
        .await?;
    Ok(envelope(found))
}

pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path((org, id)): Path<(String, String)>,
) -> ApiResult<Json<ApiEnvelope<Document>>> {
    let org = scope(&org)?;
    state
        .data
        .find_one_secure(CAMPAIGNS_COLLECTION, &doc(json!({ ID_FIELD: id })), &org)
        .await?
        .map(envelope)
        .ok_or_else(|| Error::NotFound(format!("campaign {}", id)).into())
}

pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path((org, id)): Path<(String, String)>,
    Json(update): Json<Document>,
) -> ApiResult<Json<ApiEnvelope<UpdateResult>>> {
    let org = scope(&org)?;
    let result = state
        .data
        .update_one_secure(CAMPAIGNS_COLLECTION, &doc(json!({ ID_FIELD: id })), &update, &org)
        .await?;
    if result.matched == 0 {
        return Err(Error::NotFound(format!("campaign {}", id)).into());
    }
    Ok(envelope(result))
}

pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Path((org, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let org = scope(&org)?;
    if state
        .data
        .delete_one_secure(CAMPAIGNS_COLLECTION, &doc(json!({ ID_FIELD: id })), &org)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("campaign {}", id)).into())
    }
}
