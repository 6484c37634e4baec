//! Parsing of uploaded statement bundles.
//!
//! A statement bundle is a JSON document produced by a statement processing
//! pipeline. The transactions live under the `Xns` key in one of two shapes:
//! a single columnar object of parallel arrays, or an array of objects whose
//! `bankstatement*` keys each hold such a columnar object. Account details
//! shared by every row live under `MetaData`, and the bundle identifier lives
//! under `A0000.Workorder ID`.
//!
//! Parsing is strict about the overall bundle shape but lenient about
//! individual fields: a missing column or an unparseable value becomes a
//! `None` in the affected rows rather than failing the whole upload.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use time::{
    Date, OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem,
    format_description::well_known::Rfc3339, macros::format_description,
};

use crate::{Error, transaction::NewTransaction};

/// The outcome of parsing a statement bundle.
#[derive(Debug, PartialEq)]
pub struct ParsedStatement {
    /// The bundle-level work order identifier, if present.
    pub work_order_id: Option<String>,
    /// The transaction rows found in the bundle, in document order.
    pub rows: Vec<StatementRow>,
}

/// One transaction row extracted from a statement bundle.
///
/// Every field is optional because the columnar arrays in real bundles are
/// frequently ragged. The raw account number is kept here so the upload
/// handler can mask it; it is dropped when the row is converted into a
/// [NewTransaction].
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRow {
    /// When the transaction happened.
    pub date: Option<OffsetDateTime>,
    /// A text description of the transaction.
    pub description: Option<String>,
    /// The credit/debit marker.
    pub kind: Option<String>,
    /// The amount of money that changed hands.
    pub amount: Option<f64>,
    /// The account balance after the transaction.
    pub balance: Option<f64>,
    /// The raw account number. Never persisted.
    pub account_number: Option<String>,
    /// The transaction reference.
    pub reference: Option<String>,
    /// Named entities recognised in the description.
    pub entities: Option<String>,
    /// The account's overdraft limit.
    pub od_limit: Option<f64>,
    /// Fees charged alongside the transaction.
    pub charges: Option<f64>,
    /// The name of the bank holding the account.
    pub bank_name: Option<String>,
    /// The primary category assigned to the transaction.
    pub category: Option<String>,
    /// The secondary category assigned to the transaction.
    pub category_2: Option<String>,
    /// The payment mode, e.g. UPI or cheque.
    pub mode: Option<String>,
    /// The name on the account.
    pub account_name: Option<String>,
    /// The bank branch code for the account.
    pub ifsc_code: Option<String>,
    /// The clearing code for the account.
    pub micr_code: Option<String>,
    /// The type of the account, e.g. savings or current.
    pub account_type: Option<String>,
    /// The postal code mined from the account address.
    pub pincode: Option<String>,
    /// Fingerprint of the row's identifying content.
    pub import_id: i64,
}

impl StatementRow {
    /// Convert the row into a [NewTransaction] ready for insertion.
    ///
    /// The raw account number is discarded; `masked_account_number` takes its
    /// place. `work_order_id` and `client_name` apply to every row of an
    /// upload and are stamped onto the record here.
    pub fn into_new_transaction(
        self,
        work_order_id: Option<String>,
        client_name: Option<String>,
        masked_account_number: Option<String>,
    ) -> NewTransaction {
        NewTransaction {
            work_order_id,
            client_name,
            date: self.date,
            description: self.description,
            amount: self.amount,
            kind: self.kind,
            balance: self.balance,
            reference: self.reference,
            od_limit: self.od_limit,
            charges: self.charges,
            category: self.category,
            category_2: self.category_2,
            mode: self.mode,
            masked_account_number,
            account_name: self.account_name,
            account_type: self.account_type,
            bank_name: self.bank_name,
            ifsc_code: self.ifsc_code,
            micr_code: self.micr_code,
            pincode: self.pincode,
            entities: self.entities,
            import_id: Some(self.import_id),
        }
    }
}

/// Parse a statement bundle into its work order ID and transaction rows.
///
/// # Errors
/// Returns [Error::InvalidStatement] if `text` is not valid JSON, if the
/// `Xns` key is missing, or if `Xns` is neither an object nor an array.
pub fn parse_statement(text: &str) -> Result<ParsedStatement, Error> {
    let bundle: Value = serde_json::from_str(text)
        .map_err(|error| Error::InvalidStatement(format!("invalid JSON: {error}")))?;

    let work_order_id = bundle
        .get("A0000")
        .and_then(|header| header.get("Workorder ID"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    let metadata = bundle.get("MetaData").and_then(Value::as_object);

    let rows = match bundle.get("Xns") {
        None | Some(Value::Null) => {
            return Err(Error::InvalidStatement(
                "required key 'Xns' not found".to_owned(),
            ));
        }
        Some(Value::Object(block)) => {
            let meta = match metadata {
                Some(map) => MetaSource::Object(map),
                None => MetaSource::Missing,
            };

            parse_columnar_block(block, &meta, work_order_id.as_deref(), false)
        }
        Some(Value::Array(statements)) => {
            parse_statement_list(statements, metadata, work_order_id.as_deref())
        }
        Some(other) => {
            return Err(Error::InvalidStatement(format!(
                "unexpected type for 'Xns': expected object or array, got {}",
                type_name(other)
            )));
        }
    };

    Ok(ParsedStatement {
        work_order_id,
        rows,
    })
}

/// Parse the array form of `Xns`: each element may hold one or more
/// `bankstatement*` blocks, and `MetaData` holds arrays indexed by the
/// position of the block among all blocks in the bundle.
fn parse_statement_list(
    statements: &[Value],
    metadata: Option<&Map<String, Value>>,
    work_order_id: Option<&str>,
) -> Vec<StatementRow> {
    let mut rows = Vec::new();
    let mut statement_index = 0;

    for item in statements {
        let Some(item) = item.as_object() else {
            continue;
        };

        for (key, value) in item {
            if !key.to_ascii_lowercase().starts_with("bankstatement") {
                continue;
            }

            if let Some(block) = value.as_object() {
                let meta = match metadata {
                    Some(map) => MetaSource::Indexed(map, statement_index),
                    None => MetaSource::Missing,
                };

                rows.extend(parse_columnar_block(block, &meta, work_order_id, true));
            }

            statement_index += 1;
        }
    }

    rows
}

/// Parse one columnar block of parallel arrays into rows.
///
/// The row count is the length of the block's `date` array; the other arrays
/// are read at the same index and may be shorter or missing.
/// `account_name_per_row` selects between the block's own `account_name`
/// column (array form) and the shared metadata value (object form).
fn parse_columnar_block(
    block: &Map<String, Value>,
    meta: &MetaSource,
    work_order_id: Option<&str>,
    account_name_per_row: bool,
) -> Vec<StatementRow> {
    let row_count = block
        .get("date")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    let mut rows = Vec::with_capacity(row_count);

    for index in 0..row_count {
        let fingerprint = [
            work_order_id.unwrap_or_default().to_owned(),
            raw_at(block, "date", index),
            raw_at(block, "description", index),
            raw_at(block, "credit/debit", index),
            raw_at(block, "amount", index),
            raw_at(block, "balance", index),
            raw_at(block, "account_number", index),
            raw_at(block, "reference", index),
        ]
        .join("|");

        let account_name = if account_name_per_row {
            text_at(block, "account_name", index)
        } else {
            meta.text("account_name")
        };

        rows.push(StatementRow {
            date: text_at(block, "date", index).and_then(|raw| parse_statement_date(&raw)),
            description: text_at(block, "description", index),
            kind: text_at(block, "credit/debit", index),
            amount: number_at(block, "amount", index),
            balance: number_at(block, "balance", index),
            account_number: text_at(block, "account_number", index),
            reference: text_at(block, "reference", index),
            entities: text_at(block, "renamed_entity", index),
            od_limit: number_at(block, "od_limit", index),
            charges: number_at(block, "charges", index),
            bank_name: text_at(block, "bank_name", index),
            category: text_at(block, "category", index),
            category_2: text_at(block, "category_2", index),
            mode: text_at(block, "mode", index),
            account_name,
            ifsc_code: meta.text("ifsc_code"),
            micr_code: meta.text("micr_code"),
            account_type: meta.text("account_type"),
            pincode: meta
                .text("account_address")
                .and_then(|address| extract_pincode(&address)),
            import_id: create_import_id(&fingerprint),
        });
    }

    rows
}

/// Where a block's shared account details come from.
enum MetaSource<'a> {
    /// The bundle has no usable `MetaData`.
    Missing,
    /// Object form: one value applies to every row.
    Object(&'a Map<String, Value>),
    /// Array form: the value at the statement's index applies.
    Indexed(&'a Map<String, Value>, usize),
}

impl MetaSource<'_> {
    fn text(&self, key: &str) -> Option<String> {
        match self {
            MetaSource::Missing => None,
            MetaSource::Object(map) => map.get(key).and_then(value_to_text),
            MetaSource::Indexed(map, index) => map
                .get(key)
                .and_then(Value::as_array)
                .and_then(|values| values.get(*index))
                .and_then(value_to_text),
        }
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn value_to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text_at(block: &Map<String, Value>, key: &str, index: usize) -> Option<String> {
    block
        .get(key)
        .and_then(Value::as_array)
        .and_then(|values| values.get(index))
        .and_then(value_to_text)
}

fn number_at(block: &Map<String, Value>, key: &str, index: usize) -> Option<f64> {
    block
        .get(key)
        .and_then(Value::as_array)
        .and_then(|values| values.get(index))
        .and_then(value_to_number)
}

/// The raw text of a cell for fingerprinting, before any coercion.
fn raw_at(block: &Map<String, Value>, key: &str, index: usize) -> String {
    match block
        .get(key)
        .and_then(Value::as_array)
        .and_then(|values| values.get(index))
    {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a statement date in any of the formats seen in real bundles.
///
/// Accepted, in order: RFC 3339 (including a `Z` suffix), a naive
/// `YYYY-MM-DDTHH:MM:SS` timestamp (assumed UTC), `DD/MM/YYYY`, and a plain
/// `YYYY-MM-DD` date (both midnight UTC). Anything else yields `None`.
pub fn parse_statement_date(raw: &str) -> Option<OffsetDateTime> {
    const NAIVE_DATETIME_FORMAT: &[BorrowedFormatItem] =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    const DAY_FIRST_DATE_FORMAT: &[BorrowedFormatItem] =
        format_description!("[day]/[month]/[year]");
    const PLAIN_DATE_FORMAT: &[BorrowedFormatItem] = format_description!("[year]-[month]-[day]");

    let raw = raw.trim();

    if let Ok(date_time) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(date_time);
    }

    if let Ok(date_time) = PrimitiveDateTime::parse(raw, NAIVE_DATETIME_FORMAT) {
        return Some(date_time.assume_utc());
    }

    if let Ok(date) = Date::parse(raw, DAY_FIRST_DATE_FORMAT) {
        return Some(date.midnight().assume_utc());
    }

    if let Ok(date) = Date::parse(raw, PLAIN_DATE_FORMAT) {
        return Some(date.midnight().assume_utc());
    }

    None
}

/// Extract the first standalone 6-digit postal code from an address.
pub fn extract_pincode(address: &str) -> Option<String> {
    static PINCODE: OnceLock<Regex> = OnceLock::new();

    let pattern = PINCODE.get_or_init(|| Regex::new(r"\b\d{6}\b").expect("invalid pincode regex"));

    pattern
        .find(address)
        .map(|found| found.as_str().to_owned())
}

/// Creates a fingerprint for a transaction row from its identifying content.
///
/// The first half of an MD5 digest, folded to an `i64` so it fits a SQLite
/// INTEGER column. Collisions across real statement data are vanishingly
/// unlikely.
pub fn create_import_id(row_content: &str) -> i64 {
    let hash_128 = md5::compute(row_content);
    let mut hash_64 = [0; 8];
    hash_64.copy_from_slice(&hash_128[0..8]);
    i64::from_le_bytes(hash_64)
}



#[cfg(test)]
mod extract_pincode_tests {
    use super::extract_pincode;

    #[test]
    fn finds_standalone_six_digit_code() {
        assert_eq!(
            extract_pincode("12 Harbour St, Mumbai 400001"),
            Some("400001".to_owned())
        );
    }

    #[test]
    fn takes_the_first_match() {
        assert_eq!(
            extract_pincode("PO Box 110001, Delhi 110002"),
            Some("110001".to_owned())
        );
    }

    #[test]
    fn ignores_longer_digit_runs() {
        assert_eq!(extract_pincode("phone 9876543210"), None);
    }

    #[test]
    fn ignores_shorter_digit_runs() {
        assert_eq!(extract_pincode("flat 40001"), None);
    }

    #[test]
    fn no_digits_yields_none() {
        assert_eq!(extract_pincode("Harbour Street"), None);
    }
}
