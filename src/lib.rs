//! Statement Ingest is a web service for loading bank statement bundles into
//! a relational store.
//!
//! This library provides a REST API with a single upload endpoint that parses
//! uploaded statement files into transaction records, plus read endpoints for
//! querying the stored transactions as JSON.

#![warn(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_server::Handle;
use serde::{Deserialize, Serialize};
use tokio::signal;

mod app_state;
mod db;
mod logging;
mod routing;
mod upload;

pub mod endpoints;
pub mod masking;
pub mod pagination;
pub mod statement;
pub mod transaction;

pub use app_state::AppState;
pub use db::initialize as initialize_db;
pub use logging::logging_middleware;
pub use pagination::PaginationConfig;
pub use routing::build_router;
pub use upload::UploadResponse;

/// An async task that waits for either the ctrl+c or terminate signal, whichever comes first, and
/// then signals the server to shut down gracefully.
///
/// `handle` is a handle to an Axum `Server`.
pub async fn graceful_shutdown(handle: Handle<SocketAddr>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
    }
}

/// The errors that may occur in the application.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The multipart form could not be read, or it was missing the file field.
    #[error("Could not parse multipart form: {0}")]
    MultipartError(String),

    /// The uploaded file was not a JSON file.
    #[error("Invalid file type. Only JSON files are accepted.")]
    NotJson,

    /// The uploaded file contained no data.
    #[error("Uploaded file is empty")]
    EmptyFile,

    /// The uploaded file was not a valid statement bundle.
    ///
    /// Covers malformed JSON as well as a bundle whose `Xns` entry is
    /// missing or has an unexpected shape.
    #[error("Invalid statement bundle: {0}")]
    InvalidStatement(String),

    /// The statement bundle parsed successfully but yielded no rows.
    #[error("No transaction data found in the statement bundle")]
    EmptyStatement,

    /// The specified import ID already exists in the database.
    ///
    /// Each row parsed from an uploaded statement carries an import ID that
    /// fingerprints its content. Rejecting duplicate import IDs avoids
    /// storing the same transaction twice when statement files overlap.
    #[error("the import ID already exists in the database")]
    DuplicateImportId,

    /// The requested resource was not found.
    ///
    /// For HTTP request handlers, the client should check that the parameters
    /// (e.g., ID) are correct and that the resource has been created.
    ///
    /// Internally, this error may occur when a query returns no rows.
    #[error("the requested resource could not be found")]
    NotFound,

    /// Could not acquire the database lock
    #[error("could not acquire the database lock")]
    DatabaseLockError,

    /// An unhandled/unexpected SQL error.
    #[error("an unexpected SQL error occurred: {0}")]
    SqlError(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            // Code 2067 occurs when a UNIQUE constraint failed.
            rusqlite::Error::SqliteFailure(sql_error, Some(ref desc))
                if sql_error.extended_code == 2067 && desc.ends_with("transaction.import_id") =>
            {
                Error::DuplicateImportId
            }
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            error => {
                tracing::error!("an unhandled SQL error occurred: {}", error);
                Error::SqlError(error)
            }
        }
    }
}

/// The JSON body used for all error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// A human-readable description of what went wrong.
    pub error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::MultipartError(_)
            | Error::NotJson
            | Error::EmptyFile
            | Error::InvalidStatement(_)
            | Error::EmptyStatement
            | Error::DuplicateImportId => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            // Any errors that are not handled above are not intended to be shown to the client.
            Error::DatabaseLockError | Error::SqlError(_) => {
                tracing::error!("An unexpected error occurred: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred, check the server logs for more details."
                        .to_owned(),
                )
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
