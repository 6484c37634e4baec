//! Account number masking.
//!
//! Raw account numbers are never persisted. Before a statement's rows are
//! stored, the account number is replaced with a masked form that keeps only
//! its trailing digits.

use rusqlite::Connection;

use crate::Error;

/// Mask an account number, keeping only its trailing digits visible.
///
/// Shows the last 4 digits, or the last 5 when `known_account` indicates the
/// 4-digit mask already exists in the database.
///
/// Inputs that already contain a mask character (`x`/`X`) and inputs of 4
/// characters or fewer are returned unchanged. An empty input masks to
/// nothing.
pub fn mask_account_number(account_number: &str, known_account: bool) -> Option<String> {
    let account_number = account_number.trim();

    if account_number.is_empty() {
        return None;
    }

    if account_number.to_lowercase().contains('x') {
        // Already masked, e.g. from a re-exported statement.
        return Some(account_number.to_owned());
    }

    let chars: Vec<char> = account_number.chars().collect();

    if chars.len() <= 4 {
        return Some(account_number.to_owned());
    }

    let digits_to_show = if known_account { 5 } else { 4 };
    let digits_to_show = digits_to_show.min(chars.len());

    let mut masked = "X".repeat(chars.len() - digits_to_show);
    masked.extend(&chars[chars.len() - digits_to_show..]);

    Some(masked)
}

/// Mask an account number, checking the database to decide how many digits to
/// keep visible.
///
/// An account whose 4-digit mask is already stored is considered known and
/// keeps 5 digits, so repeat uploads for the same account remain
/// distinguishable from first sightings.
///
/// # Errors
/// Returns an [Error::SqlError] if the existence check fails.
pub fn lookup_masked_account_number(
    account_number: &str,
    connection: &Connection,
) -> Result<Option<String>, Error> {
    let Some(masked) = mask_account_number(account_number, false) else {
        return Ok(None);
    };

    let exists: bool = connection
        .prepare("SELECT EXISTS(SELECT 1 FROM \"transaction\" WHERE masked_account_number = :masked)")?
        .query_row(&[(":masked", &masked)], |row| row.get(0))?;

    if exists {
        Ok(mask_account_number(account_number, true))
    } else {
        Ok(masked.into())
    }
}


#[cfg(test)]
mod lookup_tests {
    use rusqlite::Connection;

    use crate::{
        db::initialize,
        statement::parse_statement,
        transaction::import_transactions,
    };

    use super::lookup_masked_account_number;

    fn get_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn
    }

    const BUNDLE: &str = r#"{
        "A0000": {"Workorder ID": "WO-900"},
        "Xns": {
            "date": ["2025-01-15T00:00:00Z"],
            "description": ["EFTPOS PURCHASE"],
            "credit/debit": ["debit"],
            "amount": [-42.0],
            "balance": [100.0],
            "account_number": ["1234567890"]
        }
    }"#;

    #[test]
    fn unknown_account_keeps_four_digits() {
        let conn = get_test_connection();

        let masked = lookup_masked_account_number("1234567890", &conn).unwrap();

        assert_eq!(masked, Some("XXXXXX7890".to_owned()));
    }

    #[test]
    fn known_account_keeps_five_digits() {
        let conn = get_test_connection();

        let parsed = parse_statement(BUNDLE).unwrap();
        let rows = parsed
            .rows
            .into_iter()
            .map(|row| {
                row.into_new_transaction(
                    parsed.work_order_id.clone(),
                    None,
                    Some("XXXXXX7890".to_owned()),
                )
            })
            .collect();
        import_transactions(rows, &conn).unwrap();

        let masked = lookup_masked_account_number("1234567890", &conn).unwrap();

        assert_eq!(masked, Some("XXXXX67890".to_owned()));
    }
}
