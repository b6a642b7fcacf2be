//! Input sanitization applied before any caller text reaches a prompt.
//!
//! The injection filter is a small fixed list of heuristics.  It lowers the
//! odds of a request steering the model, nothing more.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::util::{
    ac_for, for_each_string_mut, preview, replace_all_folded, truncate_chars, PREVIEW_CHARS,
};
use crate::{AdditionalFields, GenerationRequest, ParentContext};

/// Hard cap on characters kept from any single string field.
pub const MAX_INPUT_CHARS: usize = 2000;

/// Replacement for every neutralized injection signature.
pub const FILTERED_PLACEHOLDER: &str = "[FILTERED]";

struct Signature {
    name: &'static str,
    re: Regex,
}

fn signature(name: &'static str, pattern: &str) -> Signature {
    Signature {
        name,
        re: Regex::new(pattern).unwrap(),
    }
}

static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    vec![
        signature(
            "ignore_previous",
            r"(?i)\bignore\s+(?:all\s+)?(?:the\s+|any\s+)?(?:previous|prior|above|earlier)\s+(?:instructions?|prompts?|rules?|messages?)",
        ),
        signature(
            "disregard_previous",
            r"(?i)\bdisregard\s+(?:all\s+)?(?:the\s+|any\s+)?(?:previous|prior|above|earlier)(?:\s+(?:instructions?|prompts?|rules?|messages?))?",
        ),
        signature(
            "forget_previous",
            r"(?i)\bforget\s+(?:all\s+|everything\s+)?(?:the\s+)?(?:previous|prior|above|earlier)(?:\s+(?:instructions?|prompts?|rules?|messages?))?",
        ),
        signature("role_prefix", r"(?i)\b(?:system|assistant)\s*:"),
        signature(
            "chat_markup",
            r"(?i)<\|?\s*(?:im_start|im_end|system|assistant|endoftext)\s*\|?>",
        ),
        signature("inst_markup", r"(?i)\[\s*/?\s*(?:inst|system)\s*\]"),
        signature("you_are_now", r"(?i)\byou\s+are\s+now\b"),
        signature("new_instructions", r"(?i)\bnew\s+instructions\s*:"),
    ]
});

/// Scalar and request-level sanitizer.  Deterministic; the only side effect
/// is a `warn` event per neutralized signature.
#[derive(Clone, Debug)]
pub struct Sanitizer {
    max_chars: usize,
    extra_signatures: Vec<String>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(MAX_INPUT_CHARS, Vec::new())
    }
}

impl Sanitizer {
    pub fn new(max_chars: usize, extra_signatures: Vec<String>) -> Self {
        let extra_signatures = extra_signatures
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            max_chars,
            extra_signatures,
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Trim, strip control characters (newline and tab survive), cap the
    /// length, then neutralize injection signatures.  The result never
    /// exceeds `max_chars`, placeholders included.
    pub fn sanitize(&self, input: &str) -> String {
        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        let trimmed = cleaned.trim();
        let mut out = truncate_chars(trimmed, self.max_chars).to_string();

        for sig in SIGNATURES.iter() {
            if let Some(m) = sig.re.find(&out) {
                tracing::warn!(
                    target: "sanitizer",
                    signature = sig.name,
                    preview = %preview(m.as_str(), PREVIEW_CHARS),
                    "neutralized prompt-injection signature"
                );
                out = sig
                    .re
                    .replace_all(&out, FILTERED_PLACEHOLDER)
                    .into_owned();
            }
        }

        if let Some(ac) = ac_for(&self.extra_signatures) {
            if let Some((first, replaced)) = replace_all_folded(&ac, &out, FILTERED_PLACEHOLDER) {
                tracing::warn!(
                    target: "sanitizer",
                    signature = "configured",
                    preview = %preview(&first, PREVIEW_CHARS),
                    "neutralized prompt-injection signature"
                );
                out = replaced;
            }
        }

        // Placeholders can be longer than what they replace.
        if out.chars().count() > self.max_chars {
            out = truncate_chars(&out, self.max_chars).to_string();
        }
        out
    }

    fn sanitize_opt(&self, value: Option<String>) -> Option<String> {
        value.map(|v| self.sanitize(&v))
    }

    /// Apply [`Sanitizer::sanitize`] to every string in the request,
    /// including nested context objects and free-form extra fields.
    pub fn sanitize_request(&self, req: GenerationRequest) -> GenerationRequest {
        let GenerationRequest {
            story_level,
            user_input,
            parent_context,
            additional_fields,
            parent_id,
        } = req;

        let parent_context = parent_context.map(|pc| ParentContext {
            level: pc.level,
            title: self.sanitize(&pc.title),
            description: self.sanitize_opt(pc.description),
            business_objective: self.sanitize_opt(pc.business_objective),
            user_value: self.sanitize_opt(pc.user_value),
        });

        let additional_fields = additional_fields.map(|af| {
            let mut extra = af.extra;
            for (_k, v) in extra.iter_mut() {
                for_each_string_mut(v, &mut |s: &mut String| *s = self.sanitize(s));
            }
            AdditionalFields {
                user_role: self.sanitize_opt(af.user_role),
                goal: self.sanitize_opt(af.goal),
                context: self.sanitize_opt(af.context),
                extra,
            }
        });

        GenerationRequest {
            story_level,
            user_input: self.sanitize(&user_input),
            parent_context,
            additional_fields,
            parent_id: self.sanitize_opt(parent_id),
        }
    }
}

/// Sanitize a single string with the default limits.
pub fn sanitize(input: &str) -> String {
    Sanitizer::default().sanitize(input)
}

/// Sanitize every string field of a request with the default limits.
pub fn sanitize_request(req: GenerationRequest) -> GenerationRequest {
    Sanitizer::default().sanitize_request(req)
}
