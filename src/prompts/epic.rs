use super::{push_request, PromptContext};

pub const PERSONA: &str = "You are a strategic product lead. You turn broad business intentions into well-framed epics with a clear objective, measurable outcomes and the stakeholders who own them.";

pub const REQUIRED_FIELDS: &[&str] = &[
    "title",
    "description",
    "businessObjective",
    "successMetrics",
    "theme",
    "stakeholders",
    "startDate",
    "targetDate",
    "status",
];

pub fn render(ctx: &PromptContext) -> String {
    let mut buf = String::from("Create an epic for the following initiative.\n\n");
    push_request(&mut buf, ctx);
    buf.push_str(
        r#"Return a JSON object with exactly these fields:
{
  "title": "concise epic title, at most 80 characters",
  "description": "two or three sentences describing the initiative and its scope",
  "businessObjective": "the business outcome this epic drives",
  "successMetrics": ["3 to 5 measurable success metrics, each with a target value"],
  "theme": "the strategic theme this epic belongs to",
  "stakeholders": ["roles or teams with a stake in the outcome"],
  "startDate": "proposed start date as YYYY-MM-DD",
  "targetDate": "proposed completion date as YYYY-MM-DD, after startDate",
  "status": "draft"
}"#,
    );
    buf
}
