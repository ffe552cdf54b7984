//! Extraction of user-facing messages from provider error bodies.
//!
//! Every provider reports HTTP failures with a different JSON schema; this
//! module walks the known shapes in a fixed order and composes one display
//! string. It is a pure function of status + body and never fails.

use serde_json::Value;

/// Composes the user-facing message for a non-OK HTTP response.
///
/// Returns `API error (<status>): <detail>` when a detail string can be
/// extracted from the body, falling back to the HTTP status text.
pub fn extract_api_error(status: u16, status_text: &str, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(detail_from_value)
        .map(|detail| {
            detail
                .strip_prefix("* ")
                .map_or_else(|| detail.clone(), str::to_string)
        })
        .filter(|detail| !detail.is_empty());

    match detail {
        Some(detail) => format!("API error ({status}): {detail}"),
        None => format!("API error ({status}): {status_text}"),
    }
}

/// Walks the known provider error shapes in a fixed order.
fn detail_from_value(value: &Value) -> Option<String> {
    // Top-level array form: [{"error": {"message": ...}}] (Gemini)
    if let Some(first) = value.as_array().and_then(|arr| arr.first()) {
        return first
            .get("error")
            .and_then(|err| err.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    // "message" as a string, or an object carrying "detail"/"error"
    match value.get("message") {
        Some(Value::String(message)) => return Some(message.clone()),
        Some(Value::Object(fields)) => {
            if let Some(detail) = fields.get("detail").and_then(Value::as_str) {
                return Some(detail.to_string());
            }
            if let Some(error) = fields.get("error").and_then(Value::as_str) {
                return Some(error.to_string());
            }
        }
        _ => {}
    }

    // "error.message", then "error" as a bare string (OpenAI family)
    if let Some(error) = value.get("error") {
        if let Some(message) = error.get("message").and_then(Value::as_str) {
            return Some(message.to_string());
        }
        if let Some(message) = error.as_str() {
            return Some(message.to_string());
        }
    }

    // "detail" as a string (Mistral)
    value
        .get("detail")
        .and_then(Value::as_str)
        .map(str::to_string)
}
