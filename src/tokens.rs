//! Provider-agnostic token estimate for composed prompts.
//!
//! A blend of character and word counts: 70% weight on `chars / 4` and 30% on the
//! whitespace-separated word count, rounded up.  Replace `estimate` with the
//! provider's tokenizer if exact budget enforcement is ever needed.

use serde::Serialize;

/// Result of checking a text against a token ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub valid: bool,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn estimate(text: &str) -> usize {
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    // 0.7 * chars / 4 + 0.3 * words == (7 * chars + 12 * words) / 40
    (7 * chars + 12 * words).div_ceil(40)
}

pub fn validate_budget(text: &str, max_tokens: usize) -> BudgetCheck {
    let token_count = estimate(text);
    if token_count > max_tokens {
        BudgetCheck {
            valid: false,
            token_count,
            message: Some(format!(
                "Estimated prompt size of {} tokens exceeds the limit of {} tokens",
                token_count, max_tokens
            )),
        }
    } else {
        BudgetCheck {
            valid: true,
            token_count,
            message: None,
        }
    }
}
