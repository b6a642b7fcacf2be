//! Recover the JSON payload from a model's raw reply.

use memchr::{memchr, memmem};

use crate::error::GenerationError;
use crate::util::{preview, PREVIEW_CHARS};
use crate::GenerationResult;

const FENCE: &[u8] = b"```";

/// Trim, unwrap a surrounding code fence (with or without a language tag)
/// and parse what remains as JSON.  Shape checks are left to the caller.
pub fn extract(raw: &str) -> Result<GenerationResult, GenerationError> {
    let body = unwrap_fence(raw.trim()).trim();
    if body.is_empty() {
        return Err(GenerationError::MalformedOutput {
            reason: "empty response".into(),
            preview: preview(raw, PREVIEW_CHARS),
        });
    }
    serde_json::from_str(body).map_err(|err| GenerationError::MalformedOutput {
        reason: format!("invalid JSON: {}", err),
        preview: preview(body, PREVIEW_CHARS),
    })
}

fn unwrap_fence(text: &str) -> &str {
    let bytes = text.as_bytes();
    if !bytes.starts_with(FENCE) {
        return text;
    }
    // Skip the opening fence line, language tag included.
    let start = match memchr(b'\n', bytes) {
        Some(nl) => nl + 1,
        None => {
            // Single line such as ```{"a":1}```
            let inner = &text[FENCE.len()..];
            return inner.strip_suffix("```").unwrap_or(inner);
        }
    };
    let rest = &text[start..];
    match memmem::rfind(rest.as_bytes(), FENCE) {
        Some(end) => &rest[..end],
        None => rest,
    }
}
