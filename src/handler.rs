use std::sync::Arc;

use axum::{
    Json, Router, async_trait,
    extract::FromRequestParts,
    http::{Method, request::Parts},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::APIResponse;
use crate::borrow;
use crate::config::BorrowPolicy;
use crate::db::Database;
use crate::error::BorrowError;
use crate::model::{Actor, Role};

/// Set by the gateway once the caller is authenticated.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Path parameters; a value that fails to parse is a `Validation` error.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(BorrowError))]
pub struct IdPath<T>(pub T);

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub policy: Arc<BorrowPolicy>,
}

fn header<'p>(parts: &'p Parts, name: &str) -> Option<&'p str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = BorrowError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, ACTOR_ID_HEADER)
            .ok_or_else(|| BorrowError::Validation("missing actor id".to_string()))?
            .parse::<i64>()
            .map_err(|_| BorrowError::Validation("malformed actor id".to_string()))?;

        let raw_role = header(parts, ACTOR_ROLE_HEADER)
            .ok_or_else(|| BorrowError::Validation("missing actor role".to_string()))?;
        let role = Role::from_str(raw_role)
            .ok_or_else(|| BorrowError::Validation(format!("unknown actor role: {raw_role}")))?;

        Ok(Actor::new(id, role))
    }
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(APIResponse::new("ok", ()))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/", get(healthcheck))
        .nest("/api/v1/borrow", borrow::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<Database>, i64) {
        let db = Arc::new(Database::open_local(":memory:").await.unwrap());
        let book = db.create_book("Middlemarch", "George Eliot").await.unwrap();
        let state = AppState {
            db: db.clone(),
            policy: Arc::new(BorrowPolicy::default()),
        };
        (router(state), db, book.id)
    }

    async fn send(app: &Router, method: Method, uri: &str, actor: Option<(i64, &str)>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = actor {
            builder = builder
                .header(ACTOR_ID_HEADER, id.to_string())
                .header(ACTOR_ROLE_HEADER, role);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let (app, _, _) = app().await;
        let (status, body) = send(&app, Method::GET, "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "ok");
    }

    #[tokio::test]
    async fn test_borrow_flow_over_http() {
        let (app, db, book_id) = app().await;
        let uri = format!("/api/v1/borrow/{book_id}");

        let (status, body) = send(&app, Method::POST, &uri, Some((1, "user"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["borrowRequest"]["status"], "requested");
        let id = body["data"]["borrowRequest"]["id"].as_i64().unwrap();

        let (status, body) = send(&app, Method::POST, &uri, Some((2, "user"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let approve = format!("/api/v1/borrow/{id}/approve");
        let (status, body) = send(&app, Method::PUT, &approve, Some((1, "user"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "forbidden");

        let (status, body) = send(&app, Method::PUT, &approve, Some((9, "librarian"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["borrowRequest"]["status"], "approved");
        assert!(body["data"]["borrowRequest"]["approvedAt"].is_string());
        assert!(!db.get_book(book_id).await.unwrap().unwrap().availability);

        let (status, body) = send(&app, Method::PUT, &approve, Some((9, "librarian"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_state");

        let (status, body) = send(&app, Method::GET, "/api/v1/borrow", Some((1, "user"))).await;
        assert_eq!(status, StatusCode::OK);
        let mine = body["data"]["borrowRequests"].as_array().unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["book"]["title"], "Middlemarch");

        let returned = format!("/api/v1/borrow/{id}/return");
        let (status, _) = send(&app, Method::PUT, &returned, Some((2, "user"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = send(&app, Method::PUT, &returned, Some((1, "user"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["borrowRequest"]["status"], "returned");
        assert!(db.get_book(book_id).await.unwrap().unwrap().availability);
    }

    #[tokio::test]
    async fn test_oversight_listing_requires_staff() {
        let (app, _, book_id) = app().await;
        send(&app, Method::POST, &format!("/api/v1/borrow/{book_id}"), Some((1, "user"))).await;

        let (status, _) = send(&app, Method::GET, "/api/v1/borrow/borrow-requests", Some((1, "user"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&app, Method::GET, "/api/v1/borrow/borrow-requests", Some((5, "admin"))).await;
        assert_eq!(status, StatusCode::OK);
        let all = body["data"]["borrowRequests"].as_array().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["book"]["author"], "George Eliot");
        assert!(all[0]["user"].is_null());
    }

    #[tokio::test]
    async fn test_actor_headers_are_validated() {
        let (app, _, book_id) = app().await;
        let uri = format!("/api/v1/borrow/{book_id}");

        let (status, body) = send(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(ACTOR_ID_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::POST, &uri, Some((1, "janitor"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_ids_are_validation_errors() {
        let (app, _, _) = app().await;

        let (status, body) = send(&app, Method::PUT, "/api/v1/borrow/abc/approve", Some((3, "librarian"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(body["message"].as_str().unwrap().contains("abc"));

        let (status, body) = send(&app, Method::POST, "/api/v1/borrow/not-a-book", Some((1, "user"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let (status, body) = send(&app, Method::PUT, "/api/v1/borrow/1.5/return", Some((1, "user"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let (app, _, _) = app().await;
        let (status, body) = send(&app, Method::POST, "/api/v1/borrow/777", Some((1, "user"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Book not found");

        let (status, _) = send(&app, Method::PUT, "/api/v1/borrow/777/reject", Some((3, "librarian"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
