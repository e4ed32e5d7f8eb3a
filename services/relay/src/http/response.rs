use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_protocol::HttpErrorEnvelope;
use std::fmt::Display;

pub type HttpResponse = Response;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn internal_error(err: impl Display) -> HttpResponse {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        err.to_string(),
    )
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn conflict(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::CONFLICT, "CONFLICT", message)
}
