use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Success envelope: `{ "message": ..., "data": ... }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct APIResponse<T> {
    pub message: String,
    pub data: T,
}

impl<T: Serialize> APIResponse<T> {
    pub fn new(msg: &str, data: T) -> Self {
        APIResponse {
            message: msg.to_owned(),
            data,
        }
    }

    pub fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub kind: String,
}

pub fn ok<T: Serialize>(msg: &str, data: T) -> Response {
    APIResponse::new(msg, data).with_status(StatusCode::OK)
}

pub fn created<T: Serialize>(msg: &str, data: T) -> Response {
    APIResponse::new(msg, data).with_status(StatusCode::CREATED)
}
