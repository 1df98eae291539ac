use axum::{
    Router,
    routing::{get, post, put},
};

use super::handler;
use crate::handler::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handler::list_user_borrow_requests))
        .route("/borrow-requests", get(handler::list_all_borrow_requests))
        // Parameters sharing a segment must share a name; here `:id` is the book id.
        .route("/:id", post(handler::create_borrow_request))
        .route("/:id/approve", put(handler::approve_borrow_request))
        .route("/:id/reject", put(handler::reject_borrow_request))
        .route("/:id/return", put(handler::return_borrow_request))
}
