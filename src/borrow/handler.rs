//! HTTP Handlers for the Borrow API

use axum::{
    extract::State,
    response::Response,
};
use serde_json::json;

use super::BorrowEngine;
use crate::api;
use crate::error::BorrowResult;
use crate::handler::{AppState, IdPath};
use crate::model::Actor;

pub async fn create_borrow_request(
    State(state): State<AppState>,
    actor: Actor,
    IdPath(book_id): IdPath<i64>,
) -> BorrowResult<Response> {
    let engine = BorrowEngine::new(&state.db, &state.policy);
    let borrow_request = engine.create_borrow_request(actor, book_id).await?;
    Ok(api::created(
        "Borrow request created successfully",
        json!({ "borrowRequest": borrow_request }),
    ))
}

pub async fn list_user_borrow_requests(State(state): State<AppState>, actor: Actor) -> BorrowResult<Response> {
    let engine = BorrowEngine::new(&state.db, &state.policy);
    let borrow_requests = engine.list_user_borrow_requests(actor).await?;
    Ok(api::ok(
        "Borrow requests fetched successfully",
        json!({ "borrowRequests": borrow_requests }),
    ))
}

pub async fn list_all_borrow_requests(State(state): State<AppState>, actor: Actor) -> BorrowResult<Response> {
    let engine = BorrowEngine::new(&state.db, &state.policy);
    let borrow_requests = engine.list_all_borrow_requests(actor).await?;
    Ok(api::ok(
        "All borrow requests fetched successfully",
        json!({ "borrowRequests": borrow_requests }),
    ))
}

pub async fn approve_borrow_request(
    State(state): State<AppState>,
    actor: Actor,
    IdPath(id): IdPath<i64>,
) -> BorrowResult<Response> {
    let engine = BorrowEngine::new(&state.db, &state.policy);
    let borrow_request = engine.approve_borrow_request(actor, id).await?;
    Ok(api::ok(
        "Borrow request approved successfully",
        json!({ "borrowRequest": borrow_request }),
    ))
}

pub async fn reject_borrow_request(
    State(state): State<AppState>,
    actor: Actor,
    IdPath(id): IdPath<i64>,
) -> BorrowResult<Response> {
    let engine = BorrowEngine::new(&state.db, &state.policy);
    let borrow_request = engine.reject_borrow_request(actor, id).await?;
    Ok(api::ok(
        "Borrow request rejected successfully",
        json!({ "borrowRequest": borrow_request }),
    ))
}

pub async fn return_borrow_request(
    State(state): State<AppState>,
    actor: Actor,
    IdPath(id): IdPath<i64>,
) -> BorrowResult<Response> {
    let engine = BorrowEngine::new(&state.db, &state.policy);
    let borrow_request = engine.return_borrow_request(actor, id).await?;
    Ok(api::ok(
        "Borrowed book returned successfully",
        json!({ "borrowRequest": borrow_request }),
    ))
}
