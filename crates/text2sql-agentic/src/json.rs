//! Helpers for pulling payloads out of model responses.

/// Remove a surrounding markdown code fence, if any.
///
/// Handles ```` ```sql ````, ```` ```json ```` and bare fences.
pub fn strip_code_blocks(response: &str) -> String {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string on the opening fence line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

/// Extract the outermost JSON object from a response.
///
/// Models sometimes wrap JSON in fences or prose; this returns the slice
/// between the first `{` and the last `}`.
pub fn extract_json(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}
