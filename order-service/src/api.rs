//! HTTP ingress. `POST /orders` is the only way a SAGA starts; everything
//! after the 201 is asynchronous and observable via `GET /orders/{id}`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::events::{EventMeta, EventType, OrderCreatedEvent};
use shared::outbox;
use shared::{is_unique_violation, DbPool};
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{NewOrder, Order};
use crate::schema::orders;
use crate::state::OrderStatus;

/// Product the storefront sells when the request names none.
const DEFAULT_PRODUCT_ID: i64 = 1;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: i64,
    pub amount: i64,
    pub quantity: i32,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: i64,
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub enum ApiError {
    BadRequest(String, &'static str),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(error, code) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error,
                    code: Some(code.to_string()),
                },
            ),
            ApiError::NotFound(error) => (StatusCode::NOT_FOUND, ErrorResponse { error, code: None }),
            ApiError::Internal(e) => {
                error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "internal server error".to_string(),
                        code: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/health", get(health))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    if req.amount <= 0 {
        return Err(ApiError::BadRequest(
            "amount must be positive".to_string(),
            "INVALID_ORDER",
        ));
    }
    if req.quantity <= 0 {
        return Err(ApiError::BadRequest(
            "quantity must be positive".to_string(),
            "INVALID_ORDER",
        ));
    }

    let mut conn = state.pool.get().await.map_err(anyhow::Error::from)?;

    // Client idempotency: a replayed key returns the original order.
    if let Some(key) = req.idempotency_key.as_deref() {
        if let Some(existing) = find_by_idempotency_key(&mut conn, key).await? {
            info!(order_id = existing.id, idempotency_key = key, "order already exists");
            return Ok((StatusCode::CREATED, Json(response_for(&existing))));
        }
    }

    let now = Utc::now();
    let new_order = NewOrder {
        user_id: req.user_id,
        amount: req.amount,
        quantity: req.quantity,
        product_id: req.product_id.unwrap_or(DEFAULT_PRODUCT_ID),
        status: OrderStatus::Pending.as_str().to_string(),
        idempotency_key: req.idempotency_key.clone(),
        created_at: now,
        updated_at: now,
    };

    let result = conn
        .transaction::<Order, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let order: Order = diesel::insert_into(orders::table)
                    .values(&new_order)
                    .get_result(conn)
                    .await?;

                // The SAGA starts here: mint the correlation id and hand the
                // event to the relay atomically with the insert.
                let correlation_id = Uuid::new_v4();
                let event = OrderCreatedEvent {
                    meta: EventMeta::new(EventType::OrderCreated, correlation_id),
                    order_id: order.id,
                    user_id: order.user_id,
                    amount: order.amount,
                    quantity: order.quantity,
                    product_id: order.product_id,
                };
                outbox::enqueue(conn, "order", order.id, EventType::OrderCreated, &event).await?;

                Ok(order)
            })
        })
        .await;

    let order = match result {
        Ok(order) => order,
        // Two requests raced on the same idempotency key; the winner's row
        // is the canonical one.
        Err(e) if is_unique_violation(&e) => {
            let key = req.idempotency_key.as_deref().unwrap_or_default();
            find_by_idempotency_key(&mut conn, key)
                .await?
                .ok_or_else(|| ApiError::Internal(e))?
        }
        Err(e) => return Err(ApiError::Internal(e)),
    };

    info!(order_id = order.id, user_id = order.user_id, "order created");
    Ok((StatusCode::CREATED, Json(response_for(&order))))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Order>, ApiError> {
    let mut conn = state.pool.get().await.map_err(anyhow::Error::from)?;

    let order = orders::table
        .find(id)
        .first::<Order>(&mut conn)
        .await
        .optional()
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| ApiError::NotFound(format!("order not found: {id}")))?;

    Ok(Json(order))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

fn response_for(order: &Order) -> CreateOrderResponse {
    CreateOrderResponse {
        order_id: order.id,
        status: order.status().unwrap_or(OrderStatus::Pending),
    }
}

async fn find_by_idempotency_key(
    conn: &mut diesel_async::AsyncPgConnection,
    key: &str,
) -> Result<Option<Order>, ApiError> {
    let order = orders::table
        .filter(orders::idempotency_key.eq(key))
        .first::<Order>(conn)
        .await
        .optional()
        .map_err(anyhow::Error::from)?;
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accepts_the_minimal_body() {
        let req: CreateOrderRequest =
            serde_json::from_str(r#"{"userId":1001,"amount":50000,"quantity":1}"#).unwrap();
        assert_eq!(req.user_id, 1001);
        assert_eq!(req.product_id, None);
        assert_eq!(req.idempotency_key, None);
    }

    #[test]
    fn response_shape_is_camel_case() {
        let json = serde_json::to_value(CreateOrderResponse {
            order_id: 5,
            status: OrderStatus::Pending,
        })
        .unwrap();
        assert_eq!(json["orderId"], 5);
        assert_eq!(json["status"], "PENDING");
    }
}
