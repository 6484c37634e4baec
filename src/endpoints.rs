//! The API endpoint URIs.

/// The route for uploading a statement bundle.
pub const UPLOAD: &str = "/upload";
/// The route for listing transactions.
pub const TRANSACTIONS: &str = "/transactions";
/// The route for getting a single transaction.
pub const TRANSACTION: &str = "/transactions/{transaction_id}";
