//! Transaction management for the ingest service.
//!
//! This module contains everything related to stored transactions:
//! - The `Transaction` model and the `NewTransaction` type for rows awaiting
//!   insertion
//! - Database functions for storing, querying, and counting transactions
//! - The JSON read endpoints for single transactions and paginated listings

use std::{
    ops::RangeInclusive,
    sync::{Arc, Mutex},
};

use axum::{
    Json,
    extract::{FromRef, Path, Query, State},
};
use rusqlite::{Connection, Row, params, params_from_iter, types::Value};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::{
    AppState, Error,
    pagination::{PaginationConfig, page_count},
};

// ============================================================================
// MODELS
// ============================================================================

/// Alias for the integer type used for transaction database IDs.
pub type TransactionId = i64;

/// One transaction parsed from an uploaded statement bundle.
///
/// Every column except the ID and creation timestamp is optional: real
/// statement bundles are ragged, and an absent field is stored as NULL
/// rather than rejecting the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// The ID of the transaction.
    pub id: TransactionId,
    /// The work order the transaction's upload belonged to.
    pub work_order_id: Option<String>,
    /// The client the upload was submitted for.
    pub client_name: Option<String>,
    /// When the transaction happened.
    #[serde(with = "time::serde::rfc3339::option")]
    pub date: Option<OffsetDateTime>,
    /// A text description of the transaction.
    pub description: Option<String>,
    /// The amount of money that changed hands.
    pub amount: Option<f64>,
    /// The credit/debit marker.
    pub kind: Option<String>,
    /// The account balance after the transaction.
    pub balance: Option<f64>,
    /// The transaction reference.
    pub reference: Option<String>,
    /// The account's overdraft limit.
    pub od_limit: Option<f64>,
    /// Fees charged alongside the transaction.
    pub charges: Option<f64>,
    /// The primary category assigned to the transaction.
    pub category: Option<String>,
    /// The secondary category assigned to the transaction.
    pub category_2: Option<String>,
    /// The payment mode, e.g. UPI or cheque.
    pub mode: Option<String>,
    /// The masked account number. The raw number is never stored.
    pub masked_account_number: Option<String>,
    /// The name on the account.
    pub account_name: Option<String>,
    /// The type of the account, e.g. savings or current.
    pub account_type: Option<String>,
    /// The name of the bank holding the account.
    pub bank_name: Option<String>,
    /// The bank branch code for the account.
    pub ifsc_code: Option<String>,
    /// The clearing code for the account.
    pub micr_code: Option<String>,
    /// The postal code mined from the account address.
    pub pincode: Option<String>,
    /// Named entities recognised in the description.
    pub entities: Option<String>,
    /// Fingerprint of the row's source content, unique across the table.
    ///
    /// `Some` for rows imported from an upload, `None` for rows created by
    /// other means. The database enforces uniqueness so re-uploading a
    /// statement inserts nothing new.
    pub import_id: Option<i64>,
    /// When the row was inserted.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A transaction row ready for insertion.
///
/// Mirrors [Transaction] without the database-assigned ID and creation
/// timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTransaction {
    /// The work order the row's upload belongs to.
    pub work_order_id: Option<String>,
    /// The client the upload was submitted for.
    pub client_name: Option<String>,
    /// When the transaction happened.
    pub date: Option<OffsetDateTime>,
    /// A text description of the transaction.
    pub description: Option<String>,
    /// The amount of money that changed hands.
    pub amount: Option<f64>,
    /// The credit/debit marker.
    pub kind: Option<String>,
    /// The account balance after the transaction.
    pub balance: Option<f64>,
    /// The transaction reference.
    pub reference: Option<String>,
    /// The account's overdraft limit.
    pub od_limit: Option<f64>,
    /// Fees charged alongside the transaction.
    pub charges: Option<f64>,
    /// The primary category assigned to the transaction.
    pub category: Option<String>,
    /// The secondary category assigned to the transaction.
    pub category_2: Option<String>,
    /// The payment mode.
    pub mode: Option<String>,
    /// The masked account number.
    pub masked_account_number: Option<String>,
    /// The name on the account.
    pub account_name: Option<String>,
    /// The type of the account.
    pub account_type: Option<String>,
    /// The name of the bank holding the account.
    pub bank_name: Option<String>,
    /// The bank branch code for the account.
    pub ifsc_code: Option<String>,
    /// The clearing code for the account.
    pub micr_code: Option<String>,
    /// The postal code mined from the account address.
    pub pincode: Option<String>,
    /// Named entities recognised in the description.
    pub entities: Option<String>,
    /// Fingerprint of the row's source content.
    pub import_id: Option<i64>,
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// The column list shared by every SELECT and RETURNING clause, in the order
/// expected by `map_transaction_row`.
const TRANSACTION_COLUMNS: &str = "id, work_order_id, client_name, date, description, amount, \
    kind, balance, reference, od_limit, charges, category, category_2, mode, \
    masked_account_number, account_name, account_type, bank_name, ifsc_code, micr_code, \
    pincode, entities, import_id, created_at";

/// Create the transaction table and its indexes in the database.
///
/// # Errors
/// Returns an error if there is an SQL error.
pub fn create_transaction_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS \"transaction\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_order_id TEXT,
                client_name TEXT,
                date TEXT,
                description TEXT,
                amount REAL,
                kind TEXT,
                balance REAL,
                reference TEXT,
                od_limit REAL,
                charges REAL,
                category TEXT,
                category_2 TEXT,
                mode TEXT,
                masked_account_number TEXT,
                account_name TEXT,
                account_type TEXT,
                bank_name TEXT,
                ifsc_code TEXT,
                micr_code TEXT,
                pincode TEXT,
                entities TEXT,
                import_id INTEGER UNIQUE,
                created_at TEXT NOT NULL
                )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS transaction_work_order_id
         ON \"transaction\" (work_order_id)",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS transaction_masked_account_number
         ON \"transaction\" (masked_account_number)",
        (),
    )?;

    Ok(())
}

/// Create a new transaction in the database.
///
/// # Errors
/// This function will return a:
/// - [Error::DuplicateImportId] if the row's import ID is already stored,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn create_transaction(
    new_transaction: NewTransaction,
    connection: &Connection,
) -> Result<Transaction, Error> {
    let query = format!(
        "INSERT INTO \"transaction\" (work_order_id, client_name, date, description, amount, \
         kind, balance, reference, od_limit, charges, category, category_2, mode, \
         masked_account_number, account_name, account_type, bank_name, ifsc_code, micr_code, \
         pincode, entities, import_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20, ?21, ?22, ?23)
         RETURNING {TRANSACTION_COLUMNS}"
    );

    let transaction = connection
        .prepare(&query)?
        .query_row(
            params![
                new_transaction.work_order_id,
                new_transaction.client_name,
                new_transaction.date,
                new_transaction.description,
                new_transaction.amount,
                new_transaction.kind,
                new_transaction.balance,
                new_transaction.reference,
                new_transaction.od_limit,
                new_transaction.charges,
                new_transaction.category,
                new_transaction.category_2,
                new_transaction.mode,
                new_transaction.masked_account_number,
                new_transaction.account_name,
                new_transaction.account_type,
                new_transaction.bank_name,
                new_transaction.ifsc_code,
                new_transaction.micr_code,
                new_transaction.pincode,
                new_transaction.entities,
                new_transaction.import_id,
                OffsetDateTime::now_utc(),
            ],
            map_transaction_row,
        )
        .map_err(|error| match error {
            // Handle duplicate import_id constraint violation
            rusqlite::Error::SqliteFailure(error, Some(_)) if error.extended_code == 2067 => {
                Error::DuplicateImportId
            }
            error => error.into(),
        })?;

    Ok(transaction)
}

/// Import many transactions parsed from an uploaded statement.
///
/// All rows are inserted within a single SQL transaction. Rows whose import
/// IDs already exist in the database are skipped, and only the rows actually
/// inserted are returned.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an unexpected SQL error.
pub fn import_transactions(
    rows: Vec<NewTransaction>,
    connection: &Connection,
) -> Result<Vec<Transaction>, Error> {
    let tx = connection.unchecked_transaction()?;
    let mut imported_transactions = Vec::new();
    let created_at = OffsetDateTime::now_utc();

    let query = format!(
        "INSERT INTO \"transaction\" (work_order_id, client_name, date, description, amount, \
         kind, balance, reference, od_limit, charges, category, category_2, mode, \
         masked_account_number, account_name, account_type, bank_name, ifsc_code, micr_code, \
         pincode, entities, import_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20, ?21, ?22, ?23)
         ON CONFLICT(import_id) DO NOTHING
         RETURNING {TRANSACTION_COLUMNS}"
    );

    // Prepare the insert statement once for reuse
    let mut stmt = tx.prepare(&query)?;

    for new_transaction in rows {
        let insert_result = stmt.query_row(
            params![
                new_transaction.work_order_id,
                new_transaction.client_name,
                new_transaction.date,
                new_transaction.description,
                new_transaction.amount,
                new_transaction.kind,
                new_transaction.balance,
                new_transaction.reference,
                new_transaction.od_limit,
                new_transaction.charges,
                new_transaction.category,
                new_transaction.category_2,
                new_transaction.mode,
                new_transaction.masked_account_number,
                new_transaction.account_name,
                new_transaction.account_type,
                new_transaction.bank_name,
                new_transaction.ifsc_code,
                new_transaction.micr_code,
                new_transaction.pincode,
                new_transaction.entities,
                new_transaction.import_id,
                created_at,
            ],
            map_transaction_row,
        );

        match insert_result {
            Ok(transaction) => imported_transactions.push(transaction),
            // A conflicting import_id produces no row, which is a skip, not a failure.
            Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(error) => return Err(error.into()),
        }
    }

    drop(stmt);

    tx.commit()?;
    Ok(imported_transactions)
}

/// Retrieve a transaction from the database by its `id`.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to a valid transaction,
/// - or [Error::SqlError] there is some other SQL error.
pub fn get_transaction(id: TransactionId, connection: &Connection) -> Result<Transaction, Error> {
    let query = format!("SELECT {TRANSACTION_COLUMNS} FROM \"transaction\" WHERE id = :id");

    let transaction = connection
        .prepare(&query)?
        .query_row(&[(":id", &id)], map_transaction_row)?;

    Ok(transaction)
}

/// Check whether any stored transaction belongs to `work_order_id`.
///
/// Uploads whose work order is already in the database are skipped wholesale,
/// since a repeated work order means the same bundle was processed before.
///
/// # Errors
/// This function will return a [Error::SqlError] if there is an SQL error.
pub fn work_order_exists(work_order_id: &str, connection: &Connection) -> Result<bool, Error> {
    let exists = connection
        .prepare("SELECT EXISTS(SELECT 1 FROM \"transaction\" WHERE work_order_id = :work_order_id)")?
        .query_row(&[(":work_order_id", &work_order_id)], |row| row.get(0))?;

    Ok(exists)
}

/// The filters shared by [query_transactions] and [count_transactions].
#[derive(Debug, Default, Clone)]
pub struct TransactionFilter {
    /// Only include transactions belonging to this work order.
    pub work_order_id: Option<String>,
    /// Only include transactions dated within `date_range` (inclusive).
    /// Transactions without a date never match.
    pub date_range: Option<RangeInclusive<Date>>,
}

/// Defines how transactions should be fetched from [query_transactions].
#[derive(Debug, Default)]
pub struct TransactionQuery {
    /// Which transactions to include.
    pub filter: TransactionFilter,
    /// Selects up to the first N (`limit`) transactions.
    pub limit: Option<u64>,
    /// Ignore the first N transactions. Only has an effect if `limit` is not `None`.
    pub offset: u64,
    /// Orders transactions by date in the order `sort_date`. None returns transactions in the
    /// order they are stored.
    pub sort_date: Option<SortOrder>,
}

/// The order to sort transactions in a [TransactionQuery].
#[derive(Debug)]
pub enum SortOrder {
    /// Sort in order of increasing value.
    Ascending,
    /// Sort in order of decreasing value.
    Descending,
}

/// Build the WHERE clause and its parameters for `filter`.
///
/// Stored dates are full timestamps, so day bounds are compared through
/// SQLite's `date()`.
fn build_where_clause(filter: &TransactionFilter) -> (String, Vec<Value>) {
    let mut where_clause_parts = vec![];
    let mut query_parameters = vec![];

    if let Some(work_order_id) = &filter.work_order_id {
        where_clause_parts.push(format!(
            "work_order_id = ?{}",
            query_parameters.len() + 1
        ));
        query_parameters.push(Value::Text(work_order_id.clone()));
    }

    if let Some(date_range) = &filter.date_range {
        where_clause_parts.push(format!(
            "date IS NOT NULL AND date(date) BETWEEN date(?{}) AND date(?{})",
            query_parameters.len() + 1,
            query_parameters.len() + 2,
        ));
        query_parameters.push(Value::Text(date_range.start().to_string()));
        query_parameters.push(Value::Text(date_range.end().to_string()));
    }

    if where_clause_parts.is_empty() {
        (String::new(), query_parameters)
    } else {
        (
            String::from(" WHERE ") + &where_clause_parts.join(" AND "),
            query_parameters,
        )
    }
}

/// Query for transactions in the database.
///
/// # Errors
/// This function will return a [Error::SqlError] there is a SQL error.
pub fn query_transactions(
    query: &TransactionQuery,
    connection: &Connection,
) -> Result<Vec<Transaction>, Error> {
    let (where_clause, query_parameters) = build_where_clause(&query.filter);

    let mut query_string =
        format!("SELECT {TRANSACTION_COLUMNS} FROM \"transaction\"{where_clause}");

    match query.sort_date {
        Some(SortOrder::Ascending) => query_string.push_str(" ORDER BY date ASC"),
        Some(SortOrder::Descending) => query_string.push_str(" ORDER BY date DESC"),
        None => {}
    }

    if let Some(limit) = query.limit {
        query_string.push_str(&format!(" LIMIT {limit} OFFSET {}", query.offset));
    }

    let params = params_from_iter(query_parameters.iter());

    connection
        .prepare(&query_string)?
        .query_map(params, map_transaction_row)?
        .map(|transaction_result| transaction_result.map_err(Error::SqlError))
        .collect()
}

/// Get the number of transactions matching `filter`.
///
/// # Errors
/// This function will return a [Error::SqlError] there is some SQL error.
pub fn count_transactions(
    filter: &TransactionFilter,
    connection: &Connection,
) -> Result<u64, Error> {
    let (where_clause, query_parameters) = build_where_clause(filter);
    let query = format!("SELECT COUNT(id) FROM \"transaction\"{where_clause}");

    connection
        .query_row(&query, params_from_iter(query_parameters.iter()), |row| {
            row.get::<_, i64>(0).map(|count| count as u64)
        })
        .map_err(|error| error.into())
}

/// Map a database row to a Transaction.
fn map_transaction_row(row: &Row) -> Result<Transaction, rusqlite::Error> {
    Ok(Transaction {
        id: row.get(0)?,
        work_order_id: row.get(1)?,
        client_name: row.get(2)?,
        date: row.get(3)?,
        description: row.get(4)?,
        amount: row.get(5)?,
        kind: row.get(6)?,
        balance: row.get(7)?,
        reference: row.get(8)?,
        od_limit: row.get(9)?,
        charges: row.get(10)?,
        category: row.get(11)?,
        category_2: row.get(12)?,
        mode: row.get(13)?,
        masked_account_number: row.get(14)?,
        account_name: row.get(15)?,
        account_type: row.get(16)?,
        bank_name: row.get(17)?,
        ifsc_code: row.get(18)?,
        micr_code: row.get(19)?,
        pincode: row.get(20)?,
        entities: row.get(21)?,
        import_id: row.get(22)?,
        created_at: row.get(23)?,
    })
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// The state needed for the transaction read endpoints.
#[derive(Debug, Clone)]
pub struct TransactionReadState {
    /// The database connection for querying transactions.
    pub db_connection: Arc<Mutex<Connection>>,
    /// The config that controls how listings are paged.
    pub pagination_config: PaginationConfig,
}

impl FromRef<AppState> for TransactionReadState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            db_connection: state.db_connection.clone(),
            pagination_config: state.pagination_config.clone(),
        }
    }
}

/// A route handler for getting a transaction by its database ID.
///
/// This function will return the status code 404 if the requested resource
/// does not exist (e.g., not created yet).
pub async fn get_transaction_endpoint(
    State(state): State<TransactionReadState>,
    Path(transaction_id): Path<TransactionId>,
) -> Result<Json<Transaction>, Error> {
    let connection = state.db_connection.lock().map_err(|error| {
        tracing::error!("could not acquire database lock: {error}");
        Error::DatabaseLockError
    })?;

    get_transaction(transaction_id, &connection).map(Json)
}

/// Controls paging and filtering of the transaction listing.
#[derive(Debug, Default, Deserialize)]
pub struct TransactionListParams {
    /// The page number to return. Starts from 1.
    pub page: Option<u64>,
    /// The maximum number of transactions to return per page.
    pub per_page: Option<u64>,
    /// Only return transactions belonging to this work order.
    pub work_order_id: Option<String>,
    /// Only return transactions dated on or after this day.
    pub after: Option<Date>,
    /// Only return transactions dated on or before this day.
    pub before: Option<Date>,
}

/// One page of the transaction listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionPage {
    /// The transactions on this page, most recent first.
    pub transactions: Vec<Transaction>,
    /// The page number, starting from 1.
    pub page: u64,
    /// The page size used for this listing.
    pub per_page: u64,
    /// The total number of transactions matching the filters.
    pub total: u64,
    /// The number of pages available at this page size.
    pub total_pages: u64,
}

/// A route handler for listing transactions as JSON, most recent first.
///
/// Accepts optional `page` and `per_page` parameters, plus `work_order_id`,
/// `after`, and `before` filters. Transactions without a date are listed
/// last and never match a date filter.
pub async fn list_transactions_endpoint(
    State(state): State<TransactionReadState>,
    Query(params): Query<TransactionListParams>,
) -> Result<Json<TransactionPage>, Error> {
    let page = params
        .page
        .unwrap_or(state.pagination_config.default_page)
        .max(1);
    let per_page = params
        .per_page
        .unwrap_or(state.pagination_config.default_page_size)
        .clamp(1, state.pagination_config.max_page_size);

    let date_range = match (params.after, params.before) {
        (None, None) => None,
        (after, before) => {
            Some(after.unwrap_or(Date::MIN)..=before.unwrap_or(Date::MAX))
        }
    };

    let filter = TransactionFilter {
        work_order_id: params.work_order_id,
        date_range,
    };

    let connection = state.db_connection.lock().map_err(|error| {
        tracing::error!("could not acquire database lock: {error}");
        Error::DatabaseLockError
    })?;

    let total = count_transactions(&filter, &connection)?;

    let transactions = query_transactions(
        &TransactionQuery {
            filter,
            limit: Some(per_page),
            offset: (page - 1) * per_page,
            sort_date: Some(SortOrder::Descending),
        },
        &connection,
    )?;

    Ok(Json(TransactionPage {
        transactions,
        page,
        per_page,
        total,
        total_pages: page_count(total, per_page),
    }))
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod route_handler_tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use rusqlite::Connection;
    use time::macros::datetime;

    use crate::{Error, db::initialize, pagination::PaginationConfig};

    use super::{
        NewTransaction, TransactionListParams, TransactionReadState, create_transaction,
        get_transaction_endpoint, list_transactions_endpoint,
    };

    fn get_test_state() -> TransactionReadState {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        TransactionReadState {
            db_connection: Arc::new(Mutex::new(conn)),
            pagination_config: PaginationConfig::default(),
        }
    }

    fn sample_transaction(amount: f64, description: &str) -> NewTransaction {
        NewTransaction {
            work_order_id: Some("WO-1".to_owned()),
            date: Some(datetime!(2025-01-18 0:00 UTC)),
            description: Some(description.to_owned()),
            amount: Some(amount),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn can_get_transaction() {
        let state = get_test_state();

        let transaction = {
            let connection = state.db_connection.lock().unwrap();
            create_transaction(sample_transaction(13.34, "foobar"), &connection).unwrap()
        };

        let response = get_transaction_endpoint(State(state), Path(transaction.id)).await;

        match response {
            Ok(json) => assert_eq!(json.0, transaction),
            Err(error) => panic!("Unexpected error: {error}"),
        }
    }

    #[tokio::test]
    async fn get_missing_transaction_returns_not_found() {
        let state = get_test_state();

        let response = get_transaction_endpoint(State(state), Path(42)).await;

        assert_eq!(response.map(|json| json.0), Err(Error::NotFound));
    }

    #[tokio::test]
    async fn list_returns_paged_data() {
        let state = get_test_state();

        {
            let connection = state.db_connection.lock().unwrap();
            for i in 1..=30 {
                let mut new_transaction = sample_transaction(i as f64, &format!("#{i}"));
                new_transaction.date =
                    Some(datetime!(2025-01-01 0:00 UTC) + time::Duration::days(i));
                create_transaction(new_transaction, &connection).unwrap();
            }
        }

        let page = list_transactions_endpoint(
            State(state),
            Query(TransactionListParams {
                page: Some(2),
                per_page: Some(10),
                ..Default::default()
            }),
        )
        .await
        .expect("Could not list transactions")
        .0;

        assert_eq!(page.page, 2);
        assert_eq!(page.per_page, 10);
        assert_eq!(page.total, 30);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.transactions.len(), 10);
        // Descending by date: page 2 starts at the 11th most recent.
        assert_eq!(page.transactions[0].description, Some("#20".to_owned()));
    }

    #[tokio::test]
    async fn list_filters_by_work_order() {
        let state = get_test_state();

        {
            let connection = state.db_connection.lock().unwrap();
            create_transaction(sample_transaction(1.0, "mine"), &connection).unwrap();

            let mut other = sample_transaction(2.0, "other");
            other.work_order_id = Some("WO-2".to_owned());
            create_transaction(other, &connection).unwrap();
        }

        let page = list_transactions_endpoint(
            State(state),
            Query(TransactionListParams {
                work_order_id: Some("WO-2".to_owned()),
                ..Default::default()
            }),
        )
        .await
        .unwrap()
        .0;

        assert_eq!(page.total, 1);
        assert_eq!(page.transactions[0].description, Some("other".to_owned()));
    }

    #[tokio::test]
    async fn list_clamps_page_size() {
        let state = get_test_state();

        let page = list_transactions_endpoint(
            State(state),
            Query(TransactionListParams {
                per_page: Some(10_000),
                ..Default::default()
            }),
        )
        .await
        .unwrap()
        .0;

        assert_eq!(page.per_page, PaginationConfig::default().max_page_size);
    }
}
