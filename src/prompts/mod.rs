//! Level-specific prompt templates.
//!
//! Every [`Level`] owns a template module holding its system persona, the
//! user-prompt renderer and the output keys it asks for.  Dispatch is an
//! exhaustive `match`, so a new level cannot fall through to a default.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sanitize::MAX_INPUT_CHARS;
use crate::util::truncate_chars;
use crate::{GenerationRequest, ParentContext};

pub mod epic;
pub mod feature;
pub mod story;
pub mod task;

/// Appended to every persona.
pub const JSON_ONLY_INSTRUCTION: &str = "Your response MUST be a single valid JSON object and nothing else: no markdown, no code fences, no commentary before or after it.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Epic,
    Feature,
    Story,
    Task,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Epic, Level::Feature, Level::Story, Level::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Epic => "epic",
            Level::Feature => "feature",
            Level::Story => "story",
            Level::Task => "task",
        }
    }

    /// Level a work item of this level hangs under.
    pub fn parent(&self) -> Option<Level> {
        match self {
            Level::Epic => None,
            Level::Feature => Some(Level::Epic),
            Level::Story => Some(Level::Feature),
            Level::Task => Some(Level::Story),
        }
    }

    pub fn persona(&self) -> &'static str {
        match self {
            Level::Epic => epic::PERSONA,
            Level::Feature => feature::PERSONA,
            Level::Story => story::PERSONA,
            Level::Task => task::PERSONA,
        }
    }

    /// Keys a well-formed result for this level must carry.
    pub fn required_output_fields(&self) -> &'static [&'static str] {
        match self {
            Level::Epic => epic::REQUIRED_FIELDS,
            Level::Feature => feature::REQUIRED_FIELDS,
            Level::Story => story::REQUIRED_FIELDS,
            Level::Task => task::REQUIRED_FIELDS,
        }
    }

    pub fn min_acceptance_criteria(&self) -> usize {
        match self {
            Level::Epic => 0,
            Level::Feature => feature::MIN_ACCEPTANCE_CRITERIA,
            Level::Story => story::MIN_ACCEPTANCE_CRITERIA,
            Level::Task => task::MIN_ACCEPTANCE_CRITERIA,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable input to [`build`], assembled from a sanitized request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub level: Level,
    pub user_input: String,
    /// Only populated for non-Epic levels.
    pub parent: Option<ParentContext>,
    pub user_role: Option<String>,
    pub goal: Option<String>,
    pub extra_context: Option<String>,
}

impl PromptContext {
    pub fn from_request(req: &GenerationRequest) -> Self {
        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();
        let additional = req.additional_fields.as_ref();
        Self {
            level: req.story_level,
            user_input: req.user_input.clone(),
            parent: match req.story_level {
                Level::Epic => None,
                _ => req.parent_context.clone(),
            },
            user_role: additional.and_then(|a| non_empty(&a.user_role)),
            goal: additional.and_then(|a| non_empty(&a.goal)),
            extra_context: additional.and_then(|a| non_empty(&a.context)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

impl BuiltPrompt {
    /// Text the token budget is checked against.
    pub fn combined(&self) -> String {
        format!("{}\n\n{}", self.system_prompt, self.user_prompt)
    }
}

pub fn build(ctx: &PromptContext) -> BuiltPrompt {
    let user_prompt = match ctx.level {
        Level::Epic => epic::render(ctx),
        Level::Feature => feature::render(ctx),
        Level::Story => story::render(ctx),
        Level::Task => task::render(ctx),
    };
    BuiltPrompt {
        system_prompt: format!("{}\n\n{}", ctx.level.persona(), JSON_ONLY_INSTRUCTION),
        user_prompt,
    }
}

/// Shape problems in a generated result: missing keys and too few
/// acceptance criteria.  Empty when the result looks right.
pub fn check_shape(level: Level, result: &Value) -> Vec<String> {
    let Some(obj) = result.as_object() else {
        return vec!["result is not a JSON object".to_string()];
    };
    let mut problems = Vec::new();
    for key in level.required_output_fields() {
        match obj.get(*key) {
            None | Some(Value::Null) => problems.push(format!("missing `{}`", key)),
            Some(Value::String(s)) if s.trim().is_empty() => {
                problems.push(format!("empty `{}`", key))
            }
            _ => {}
        }
    }
    let min = level.min_acceptance_criteria();
    if min > 0 {
        let got = obj
            .get("acceptanceCriteria")
            .and_then(Value::as_array)
            .map(|a| a.len())
            .unwrap_or(0);
        if got < min {
            problems.push(format!(
                "expected at least {} acceptance criteria, got {}",
                min, got
            ));
        }
    }
    problems
}

/// Append `label: value` when the value is present and non-empty.
pub(crate) fn push_line(buf: &mut String, label: &str, value: Option<&str>) {
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        let _ = writeln!(buf, "{}: {}", label, truncate_chars(v, MAX_INPUT_CHARS));
    }
}

/// Parent block shared by Feature, Story and Task templates.  `primary` is
/// the parent field the child should build on; `description` is used when
/// it is absent.
pub(crate) fn push_parent(
    buf: &mut String,
    parent: Option<&ParentContext>,
    parent_level: Level,
    primary_label: &str,
    primary: impl Fn(&ParentContext) -> Option<&str>,
) {
    let Some(p) = parent else {
        return;
    };
    let _ = writeln!(buf, "Parent {} context:", parent_level);
    push_line(buf, "- Title", Some(&p.title));
    match primary(p).filter(|v| !v.trim().is_empty()) {
        Some(v) => push_line(buf, &format!("- {}", primary_label), Some(v)),
        None => push_line(buf, "- Description", p.description.as_deref()),
    }
    buf.push('\n');
}

/// Request block shared by all templates.
pub(crate) fn push_request(buf: &mut String, ctx: &PromptContext) {
    push_line(buf, "Request", Some(&ctx.user_input));
    push_line(buf, "Additional context", ctx.extra_context.as_deref());
    buf.push('\n');
}
