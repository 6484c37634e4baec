//! Middleware for logging requests and responses.

use std::sync::OnceLock;

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use regex::Regex;

use crate::masking::mask_account_number;

const LOG_BODY_LENGTH_LIMIT: usize = 64;

/// Log the request and response for each request.
///
/// Both the request and response are logged at the `info` level. Bodies
/// longer than a short limit are truncated, and with the full text logged at
/// the `debug` level. Long digit runs are masked before logging since upload
/// bodies carry raw account numbers.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let body_text = redact_account_numbers(&String::from_utf8_lossy(&body_bytes));
    log_request(&parts, &body_text);

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;

    let (parts, body) = response.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let body_text = redact_account_numbers(&String::from_utf8_lossy(&body_bytes));
    log_response(&parts, &body_text);

    Response::from_parts(parts, Body::from(body_bytes))
}

/// Mask digit runs long enough to be account numbers in text bound for the
/// logs.
fn redact_account_numbers(text: &str) -> String {
    static ACCOUNT_NUMBER: OnceLock<Regex> = OnceLock::new();

    let pattern = ACCOUNT_NUMBER
        .get_or_init(|| Regex::new(r"\d{9,}").expect("invalid account number regex"));

    pattern
        .replace_all(text, |captures: &regex::Captures| {
            mask_account_number(&captures[0], false).unwrap_or_default()
        })
        .into_owned()
}

fn log_request(headers: &axum::http::request::Parts, body: &str) {
    if body.len() > LOG_BODY_LENGTH_LIMIT {
        tracing::info!(
            "Received request: {headers:#?}\nbody: {:}...",
            truncate(body, LOG_BODY_LENGTH_LIMIT)
        );
        tracing::debug!("Full request body: {body:?}");
    } else {
        tracing::info!("Received request: {headers:#?}\nbody: {body:?}");
    }
}

fn log_response(headers: &axum::http::response::Parts, body: &str) {
    if body.len() > LOG_BODY_LENGTH_LIMIT {
        tracing::info!(
            "Sending response: {headers:#?}\nbody: {:}...",
            truncate(body, LOG_BODY_LENGTH_LIMIT)
        );
        tracing::debug!("Full response body: {body:?}");
    } else {
        tracing::info!("Sending response: {headers:#?}\nbody: {body:?}");
    }
}

/// Truncate `text` to at most `limit` bytes without splitting a character.
fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    &text[..end]
}

#[cfg(test)]
mod redaction_tests {
    use super::redact_account_numbers;

    #[test]
    fn masks_long_digit_runs() {
        assert_eq!(
            redact_account_numbers(r#"{"account_number": ["9876543210"]}"#),
            r#"{"account_number": ["XXXXXX3210"]}"#
        );
    }

    #[test]
    fn leaves_short_digit_runs_alone() {
        assert_eq!(
            redact_account_numbers(r#"{"amount": [1300.0], "pincode": "400001"}"#),
            r#"{"amount": [1300.0], "pincode": "400001"}"#
        );
    }

    #[test]
    fn masks_every_occurrence() {
        assert_eq!(
            redact_account_numbers("from 111122223333 to 444455556666"),
            "from XXXXXXXX3333 to XXXXXXXX6666"
        );
    }
}
