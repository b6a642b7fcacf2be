use super::{push_parent, push_request, Level, PromptContext};

pub const PERSONA: &str = "You are an experienced product manager. You break epics into features that deliver clear user value and can be verified with concrete acceptance criteria.";

pub const REQUIRED_FIELDS: &[&str] = &[
    "title",
    "description",
    "userValue",
    "acceptanceCriteria",
    "status",
    "priority",
];

pub const MIN_ACCEPTANCE_CRITERIA: usize = 4;

pub fn render(ctx: &PromptContext) -> String {
    let mut buf = String::from("Create a feature that belongs to the parent epic below.\n\n");
    push_parent(
        &mut buf,
        ctx.parent.as_ref(),
        Level::Epic,
        "Business objective",
        |p| p.business_objective.as_deref(),
    );
    push_request(&mut buf, ctx);
    buf.push_str(
        r#"The feature must contribute directly to the parent epic.

Return a JSON object with exactly these fields:
{
  "title": "concise feature title, at most 80 characters",
  "description": "what the feature does and where it fits in the epic",
  "userValue": "the value a user gets from this feature",
  "acceptanceCriteria": ["4 to 6 criteria, each written as Given <context>, When <action>, Then <outcome>"],
  "status": "draft",
  "priority": "one of low, medium, high, critical"
}"#,
    );
    buf
}
