//! The statement upload endpoint.
//!
//! Accepts a multipart form with a `file` field holding a statement bundle
//! and an optional `client_name` text field, parses the bundle into
//! transaction rows, and stores them. Duplicates are skipped at two levels:
//! a work order that is already in the database skips the whole upload, and
//! individual rows whose import IDs are already stored are skipped one by
//! one.

use std::sync::{Arc, Mutex};

use axum::{
    Json,
    extract::{FromRef, Multipart, State},
    http::StatusCode,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{
    AppState, Error,
    masking::lookup_masked_account_number,
    statement::parse_statement,
    transaction::{import_transactions, work_order_exists},
};

/// The state needed for the upload endpoint.
#[derive(Debug, Clone)]
pub struct UploadState {
    /// The database connection for storing transactions.
    pub db_connection: Arc<Mutex<Connection>>,
}

impl FromRef<AppState> for UploadState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
        }
    }
}

/// The JSON body returned by a successful upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    /// The name of the uploaded file.
    pub filename: String,
    /// A human-readable summary of the processing results.
    pub message: String,
    /// The number of transaction rows found in the uploaded file.
    pub records_processed: usize,
    /// The number of rows actually stored, after duplicate skipping.
    pub records_saved: usize,
}

/// Route handler for uploading a statement bundle.
///
/// Parses the uploaded JSON file, masks the account number, skips duplicate
/// work orders and rows, and stores the remainder. Responds with
/// `201 Created` and an [UploadResponse] summary.
pub async fn upload_statement(
    State(state): State<UploadState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), Error> {
    let mut client_name: Option<String> = None;
    let mut upload: Option<(String, String)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|error| {
        tracing::error!("Could not read multipart form field: {error}");
        Error::MultipartError("Could not read multipart form field".to_owned())
    })? {
        let field_name = field.name().map(str::to_owned);

        match field_name.as_deref() {
            Some("client_name") => {
                let name = read_field_text(field).await?;
                client_name = Some(name);
            }
            Some("file") => {
                let file_name = match field.file_name() {
                    Some(file_name) => file_name.to_owned(),
                    None => {
                        return Err(Error::MultipartError(
                            "Could not get file name from multipart form field".to_owned(),
                        ));
                    }
                };

                let is_json_name = file_name.to_lowercase().ends_with(".json");
                let is_json_type = field.content_type() == Some("application/json");
                if !is_json_name && !is_json_type {
                    tracing::debug!("Rejecting upload with file name '{file_name}'");
                    return Err(Error::NotJson);
                }

                let contents = read_field_text(field).await?;
                tracing::debug!(
                    "Received file '{}' that is {} bytes",
                    file_name,
                    contents.len()
                );

                upload = Some((file_name, contents));
            }
            _ => {}
        }
    }

    let Some((file_name, contents)) = upload else {
        return Err(Error::MultipartError(
            "the form did not contain a 'file' field".to_owned(),
        ));
    };

    if contents.is_empty() {
        return Err(Error::EmptyFile);
    }

    tracing::info!(
        "Upload request received: filename={file_name}, client_name={client_name:?}"
    );

    let parsed = parse_statement(&contents)?;

    if parsed.rows.is_empty() {
        return Err(Error::EmptyStatement);
    }

    let records_processed = parsed.rows.len();

    let connection = state.db_connection.lock().map_err(|error| {
        tracing::error!("could not acquire database lock: {error}");
        Error::DatabaseLockError
    })?;

    let (records_saved, duplicates_skipped) = if let Some(work_order_id) = &parsed.work_order_id
        && work_order_exists(work_order_id, &connection)?
    {
        tracing::info!(
            "Work order {work_order_id} already exists in the database. \
             Skipping all {records_processed} transactions."
        );
        (0, records_processed)
    } else {
        // The bundle's first account number decides the mask applied to
        // every row of this upload.
        let masked_account_number = match parsed.rows[0].account_number.as_deref() {
            Some(account_number) => lookup_masked_account_number(account_number, &connection)?,
            None => None,
        };

        let work_order_id = parsed.work_order_id.clone();
        let rows = parsed
            .rows
            .into_iter()
            .map(|row| {
                row.into_new_transaction(
                    work_order_id.clone(),
                    client_name.clone(),
                    masked_account_number.clone(),
                )
            })
            .collect();

        let imported = import_transactions(rows, &connection)?;
        let records_saved = imported.len();

        (records_saved, records_processed - records_saved)
    };

    let mut message = format!("File processed successfully. {records_saved} transactions saved.");
    if duplicates_skipped > 0 {
        message.push_str(&format!(" {duplicates_skipped} duplicates skipped."));
    }

    tracing::info!("Upload complete: {message}");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            filename: file_name,
            message,
            records_processed,
            records_saved,
        }),
    ))
}

async fn read_field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, Error> {
    field.text().await.map_err(|error| {
        tracing::error!("Could not read data from multipart form field: {error}");
        Error::MultipartError("Could not read data from multipart form field.".to_owned())
    })
}

#[cfg(test)]
mod upload_statement_tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        body::Body,
        extract::{FromRequest, Multipart, State},
        http::{Request, StatusCode},
    };
    use rusqlite::Connection;

    use crate::{
        Error,
        db::initialize,
        endpoints,
        transaction::{TransactionFilter, count_transactions, get_transaction},
    };

    use super::{UploadState, upload_statement};

    fn get_test_state() -> UploadState {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        UploadState {
            db_connection: Arc::new(Mutex::new(conn)),
        }
    }

    const COLUMNAR_BUNDLE: &str = r#"{
        "A0000": {"Workorder ID": "WO-12345"},
        "MetaData": {
            "account_name": "A B CAT",
            "ifsc_code": "ABCD0001234",
            "account_type": "savings",
            "account_address": "12 Harbour St, Mumbai 400001"
        },
        "Xns": {
            "date": ["2025-01-18T00:00:00Z", "2025-01-19T00:00:00Z"],
            "description": ["D/C FROM A B CAT", "MB TRANSFER"],
            "credit/debit": ["credit", "debit"],
            "amount": [1300.0, -1300.0],
            "balance": [1500.0, 200.0],
            "account_number": ["9876543210", "9876543210"],
            "reference": ["REF-1", "REF-2"]
        }
    }"#;

    // The same two rows repeated, under a fresh work order.
    const REPEATED_ROWS_BUNDLE: &str = r#"{
        "A0000": {"Workorder ID": "WO-77777"},
        "Xns": {
            "date": ["2025-03-01T00:00:00Z", "2025-03-01T00:00:00Z"],
            "description": ["COFFEE", "COFFEE"],
            "credit/debit": ["debit", "debit"],
            "amount": [-4.5, -4.5],
            "balance": [95.5, 95.5],
            "account_number": ["1234567890", "1234567890"],
            "reference": ["POS-1", "POS-1"]
        }
    }"#;

    struct FormField<'a> {
        name: &'a str,
        file_name: Option<&'a str>,
        content_type: Option<&'a str>,
        body: &'a str,
    }

    async fn must_make_multipart(fields: &[FormField<'_>]) -> Multipart {
        let boundary = "MY_BOUNDARY123456789";
        let boundary_start = format!("--{boundary}");
        let boundary_end = format!("--{boundary}--");

        let mut lines: Vec<String> = Vec::new();

        for field in fields {
            lines.push(boundary_start.clone());

            let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", field.name);
            if let Some(file_name) = field.file_name {
                disposition.push_str(&format!("; filename=\"{file_name}\""));
            }
            lines.push(disposition);

            if let Some(content_type) = field.content_type {
                lines.push(format!("Content-Type: {content_type}"));
            }

            lines.push(String::new());
            lines.push(field.body.to_owned());
        }

        lines.push(boundary_end);

        let data = lines.join("\r\n").into_bytes();

        let request = Request::builder()
            .method("POST")
            .uri(endpoints::UPLOAD)
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(data))
            .unwrap();

        Multipart::from_request(request, &()).await.unwrap()
    }

    async fn must_make_bundle_multipart(bundle: &str, client_name: Option<&str>) -> Multipart {
        let mut fields = vec![FormField {
            name: "file",
            file_name: Some("statement.json"),
            content_type: Some("application/json"),
            body: bundle,
        }];

        if let Some(client_name) = client_name {
            fields.push(FormField {
                name: "client_name",
                file_name: None,
                content_type: None,
                body: client_name,
            });
        }

        must_make_multipart(&fields).await
    }

    #[tokio::test]
    async fn upload_stores_all_rows() {
        let state = get_test_state();

        let (status, response) = upload_statement(
            State(state.clone()),
            must_make_bundle_multipart(COLUMNAR_BUNDLE, Some("Acme Ltd")).await,
        )
        .await
        .expect("upload should succeed");

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(response.filename, "statement.json");
        assert_eq!(response.records_processed, 2);
        assert_eq!(response.records_saved, 2);
        assert_eq!(
            response.message,
            "File processed successfully. 2 transactions saved."
        );

        let connection = state.db_connection.lock().unwrap();
        let count = count_transactions(&TransactionFilter::default(), &connection).unwrap();
        assert_eq!(count, 2);

        let transaction = get_transaction(1, &connection).unwrap();
        assert_eq!(transaction.work_order_id, Some("WO-12345".to_owned()));
        assert_eq!(transaction.client_name, Some("Acme Ltd".to_owned()));
        assert_eq!(transaction.account_name, Some("A B CAT".to_owned()));
        assert_eq!(transaction.pincode, Some("400001".to_owned()));
    }

    #[tokio::test]
    async fn upload_masks_the_account_number() {
        let state = get_test_state();

        upload_statement(
            State(state.clone()),
            must_make_bundle_multipart(COLUMNAR_BUNDLE, None).await,
        )
        .await
        .expect("upload should succeed");

        let connection = state.db_connection.lock().unwrap();
        let transaction = get_transaction(1, &connection).unwrap();

        assert_eq!(
            transaction.masked_account_number,
            Some("XXXXXX3210".to_owned()),
            "only the masked account number should be stored"
        );
    }

    #[tokio::test]
    async fn upload_skips_duplicate_work_order() {
        let state = get_test_state();

        upload_statement(
            State(state.clone()),
            must_make_bundle_multipart(COLUMNAR_BUNDLE, None).await,
        )
        .await
        .expect("first upload should succeed");

        let (status, response) = upload_statement(
            State(state.clone()),
            must_make_bundle_multipart(COLUMNAR_BUNDLE, None).await,
        )
        .await
        .expect("second upload should succeed");

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(response.records_processed, 2);
        assert_eq!(response.records_saved, 0);
        assert_eq!(
            response.message,
            "File processed successfully. 0 transactions saved. 2 duplicates skipped."
        );

        let connection = state.db_connection.lock().unwrap();
        let count = count_transactions(&TransactionFilter::default(), &connection).unwrap();
        assert_eq!(count, 2, "the duplicate upload should not add rows");
    }

    #[tokio::test]
    async fn upload_skips_duplicate_rows_within_a_bundle() {
        let state = get_test_state();

        let (_, response) = upload_statement(
            State(state.clone()),
            must_make_bundle_multipart(REPEATED_ROWS_BUNDLE, None).await,
        )
        .await
        .expect("upload should succeed");

        assert_eq!(response.records_processed, 2);
        assert_eq!(response.records_saved, 1);
        assert_eq!(
            response.message,
            "File processed successfully. 1 transactions saved. 1 duplicates skipped."
        );
    }

    #[tokio::test]
    async fn upload_rejects_non_json_file() {
        let state = get_test_state();

        let result = upload_statement(
            State(state.clone()),
            must_make_multipart(&[FormField {
                name: "file",
                file_name: Some("statement.csv"),
                content_type: Some("text/csv"),
                body: "date,amount\n2025-01-01,1.0",
            }])
            .await,
        )
        .await;

        assert_eq!(result.map(|_| ()), Err(Error::NotJson));

        let connection = state.db_connection.lock().unwrap();
        let count = count_transactions(&TransactionFilter::default(), &connection).unwrap();
        assert_eq!(count, 0, "want 0 transactions created, got {count}");
    }

    #[tokio::test]
    async fn upload_accepts_json_by_file_extension_alone() {
        let state = get_test_state();

        let (status, _) = upload_statement(
            State(state),
            must_make_multipart(&[FormField {
                name: "file",
                file_name: Some("statement.JSON"),
                content_type: None,
                body: REPEATED_ROWS_BUNDLE,
            }])
            .await,
        )
        .await
        .expect("upload should succeed");

        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn upload_rejects_empty_file() {
        let state = get_test_state();

        let result = upload_statement(
            State(state),
            must_make_bundle_multipart("", None).await,
        )
        .await;

        assert_eq!(result.map(|_| ()), Err(Error::EmptyFile));
    }

    #[tokio::test]
    async fn upload_rejects_malformed_json() {
        let state = get_test_state();

        let result = upload_statement(
            State(state),
            must_make_bundle_multipart("{not json", None).await,
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidStatement(_))));
    }

    #[tokio::test]
    async fn upload_rejects_bundle_without_rows() {
        let state = get_test_state();

        let result = upload_statement(
            State(state),
            must_make_bundle_multipart(r#"{"Xns": {"date": []}}"#, None).await,
        )
        .await;

        assert_eq!(result.map(|_| ()), Err(Error::EmptyStatement));
    }

    #[tokio::test]
    async fn upload_rejects_missing_file_field() {
        let state = get_test_state();

        let result = upload_statement(
            State(state),
            must_make_multipart(&[FormField {
                name: "client_name",
                file_name: None,
                content_type: None,
                body: "Acme Ltd",
            }])
            .await,
        )
        .await;

        assert_eq!(
            result.map(|_| ()),
            Err(Error::MultipartError(
                "the form did not contain a 'file' field".to_owned()
            ))
        );
    }
}
