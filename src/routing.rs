//! Application router configuration.

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    AppState, ErrorBody, endpoints,
    transaction::{get_transaction_endpoint, list_transactions_endpoint},
    upload::upload_statement,
};

/// Return a router with all the app's routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::UPLOAD, post(upload_statement))
        .route(endpoints::TRANSACTIONS, get(list_transactions_endpoint))
        .route(endpoints::TRANSACTION, get(get_transaction_endpoint))
        .fallback(get_404_not_found)
        .with_state(state)
}

/// The response for requests to routes that do not exist.
async fn get_404_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "the requested resource could not be found".to_owned(),
        }),
    )
        .into_response()
}
