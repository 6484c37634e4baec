use std::error::Error;
use std::path::Path;
use std::process::exit;

use clap::Parser;
use rusqlite::Connection;

use statement_ingest::{
    initialize_db, masking::lookup_masked_account_number, statement::parse_statement,
    transaction::import_transactions,
};

/// A utility for creating a test database for the statement-ingest server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to save the SQLite database to.
    #[arg(long, short)]
    output_path: String,
}

const SAMPLE_BUNDLE: &str = r#"{
    "A0000": {"Workorder ID": "WO-SAMPLE-1"},
    "MetaData": {
        "account_name": "A B CAT",
        "ifsc_code": "ABCD0001234",
        "micr_code": "400002004",
        "account_type": "savings",
        "account_address": "12 Harbour St, Mumbai 400001"
    },
    "Xns": {
        "date": ["2025-01-18T00:00:00Z", "2025-01-22T00:00:00Z", "2025-01-26T00:00:00Z"],
        "description": ["SALARY JANUARY", "POS W/D LOBSTER SEAFOO-19:47", "TRANSFER TO SAVINGS"],
        "credit/debit": ["credit", "debit", "debit"],
        "amount": [5000.0, -32.0, -500.0],
        "balance": [5200.0, 5168.0, 4668.0],
        "account_number": ["9876543210", "9876543210", "9876543210"],
        "reference": ["SAL-2025-01", "POS-1881", "TFR-204"],
        "bank_name": ["Harbour Bank", "Harbour Bank", "Harbour Bank"],
        "category": ["income", "dining", "transfer"],
        "mode": ["NEFT", "POS", "IMPS"]
    }
}"#;

/// Create and populate a database for manual testing.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let output_path = Path::new(&args.output_path);

    match output_path.extension() {
        None => {
            eprintln!("Output path must include a file extension (e.g., 'my_database.db').");
            exit(1);
        }
        Some(extension) if extension.is_empty() => {
            eprintln!("Output path must include a file extension (e.g., 'my_database.db').");
            exit(1);
        }
        _ => {}
    }

    if output_path.is_file() {
        eprintln!("File already exists at {output_path:#?}!");
        exit(1);
    }

    println!("Creating database at {output_path:#?}");
    let conn = Connection::open(output_path)?;

    initialize_db(&conn)?;

    println!("Importing sample statement...");

    let parsed = parse_statement(SAMPLE_BUNDLE)?;

    let masked_account_number = match parsed.rows.first().and_then(|row| row.account_number.clone())
    {
        Some(account_number) => lookup_masked_account_number(&account_number, &conn)?,
        None => None,
    };

    let work_order_id = parsed.work_order_id.clone();
    let rows = parsed
        .rows
        .into_iter()
        .map(|row| {
            row.into_new_transaction(
                work_order_id.clone(),
                Some("Sample Client".to_owned()),
                masked_account_number.clone(),
            )
        })
        .collect();

    let imported = import_transactions(rows, &conn)?;

    println!("Imported {} transactions.", imported.len());
    println!("Success!");

    Ok(())
}
