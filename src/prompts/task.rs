use super::{push_parent, push_request, Level, PromptContext};

pub const PERSONA: &str = "You are a technical lead. You split user stories into small, concrete engineering tasks that one developer can finish and verify.";

pub const REQUIRED_FIELDS: &[&str] = &[
    "title",
    "description",
    "technicalNotes",
    "estimatedHours",
    "acceptanceCriteria",
    "storyType",
];

pub const MIN_ACCEPTANCE_CRITERIA: usize = 2;

pub fn render(ctx: &PromptContext) -> String {
    let mut buf = String::from("Define an engineering task for the parent story below.\n\n");
    push_parent(
        &mut buf,
        ctx.parent.as_ref(),
        Level::Story,
        "Description",
        |p| p.description.as_deref(),
    );
    push_request(&mut buf, ctx);
    buf.push_str(
        r#"Return a JSON object with exactly these fields:
{
  "title": "action-oriented title starting with a verb, at most 80 characters",
  "description": "what has to be done and why",
  "technicalNotes": "approach, affected components, edge cases",
  "estimatedHours": "estimate in hours as a number",
  "acceptanceCriteria": ["2 to 3 verifiable criteria"],
  "storyType": "task"
}"#,
    );
    buf
}
