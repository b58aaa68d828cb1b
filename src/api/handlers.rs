// HTTP request handlers for API endpoints

use actix_web::{web, HttpResponse, Result};
use serde::Serialize;

use crate::api::models::*;
use crate::platform::{BackingError, BackingRequest, Platform, ProfileUpdate, TierChange};
use crate::store::{Datastore, StoreError};

fn ok<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(data))
}

fn rejected(e: BackingError) -> HttpResponse {
    let body = ApiResponse::<()>::error(e.to_string());
    match &e {
        BackingError::NotFound(_) => HttpResponse::NotFound().json(body),
        BackingError::Unauthorized => HttpResponse::Unauthorized().json(body),
        e if e.is_internal() => {
            tracing::error!(error = ?e, "request failed");
            HttpResponse::InternalServerError().json(body)
        }
        _ => HttpResponse::BadRequest().json(body),
    }
}

fn store_failure(e: StoreError) -> HttpResponse {
    rejected(BackingError::Store(e))
}

pub async fn health_check() -> Result<HttpResponse> {
    Ok(ok(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

pub async fn start_backing<S: Datastore>(
    platform: web::Data<Platform<S>>,
    payload: web::Json<BackingRequest>,
) -> Result<HttpResponse> {
    Ok(match platform.start_backing(&payload).await {
        Ok(receipt) => HttpResponse::Created().json(ApiResponse::success(receipt)),
        Err(e) => rejected(e),
    })
}

pub async fn change_tier<S: Datastore>(
    platform: web::Data<Platform<S>>,
    path: web::Path<i64>,
    payload: web::Json<TierChange>,
) -> Result<HttpResponse> {
    Ok(platform
        .change_tier(path.into_inner(), &payload)
        .await
        .map_or_else(rejected, ok))
}

pub async fn cancel_backing<S: Datastore>(
    platform: web::Data<Platform<S>>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let backer_id = path.into_inner();
    Ok(match platform.cancel_backing(backer_id).await {
        Ok(()) => ok(serde_json::json!({ "backer_id": backer_id, "cancelled": true })),
        Err(e) => rejected(e),
    })
}

pub async fn update_profile<S: Datastore>(
    platform: web::Data<Platform<S>>,
    path: web::Path<i64>,
    payload: web::Json<ProfileUpdate>,
) -> Result<HttpResponse> {
    Ok(platform
        .update_profile(path.into_inner(), &payload)
        .await
        .map_or_else(rejected, ok))
}

pub async fn update_card<S: Datastore>(
    platform: web::Data<Platform<S>>,
    path: web::Path<i64>,
    payload: web::Json<CardUpdateRequest>,
) -> Result<HttpResponse> {
    let backer_id = path.into_inner();
    Ok(match platform.update_card(backer_id, &payload.card_token).await {
        Ok(()) => ok(serde_json::json!({ "backer_id": backer_id, "updated": true })),
        Err(e) => rejected(e),
    })
}

pub async fn force_sync<S: Datastore>(
    platform: web::Data<Platform<S>>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    Ok(match platform.force_sync(path.into_inner()).await {
        Ok(errors) => ok(SyncResponse {
            synced: errors.is_empty(),
            errors,
        }),
        Err(e) => rejected(e),
    })
}

pub async fn totals<S: Datastore>(platform: web::Data<Platform<S>>) -> Result<HttpResponse> {
    Ok(match platform.totals().await {
        Ok(summary) => ok(&*summary),
        Err(e) => store_failure(e),
    })
}

pub async fn sponsors<S: Datastore>(platform: web::Data<Platform<S>>) -> Result<HttpResponse> {
    Ok(match platform.sponsors().await {
        Ok(cards) => ok(&*cards),
        Err(e) => store_failure(e),
    })
}

pub async fn cron_sync<S: Datastore>(platform: web::Data<Platform<S>>) -> Result<HttpResponse> {
    tracing::info!("sweep requested over HTTP");
    Ok(match platform.run_sweep().await {
        Ok(report) => ok(report),
        Err(e) => store_failure(e),
    })
}

pub async fn processor_webhook<S: Datastore>(
    platform: web::Data<Platform<S>>,
    path: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    Ok(platform
        .handle_processor_event(&path.into_inner(), &body)
        .await
        .map_or_else(rejected, ok))
}
