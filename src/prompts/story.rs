use super::{push_line, push_parent, push_request, Level, PromptContext};

pub const PERSONA: &str = "You are an agile coach who writes clear, independent, estimable and testable user stories that a delivery team can pick up without further clarification.";

pub const REQUIRED_FIELDS: &[&str] = &[
    "title",
    "description",
    "acceptanceCriteria",
    "priority",
    "storyPoints",
    "persona",
    "problemStatement",
    "businessValue",
    "assumptions",
    "risks",
    "technicalNotes",
    "dependencies",
    "storyType",
    "tags",
    "definitionOfReady",
    "definitionOfDone",
    "confidenceLevel",
    "customerJourneyStage",
];

pub const MIN_ACCEPTANCE_CRITERIA: usize = 3;

pub fn render(ctx: &PromptContext) -> String {
    let mut buf = String::from("Write a user story that belongs to the parent feature below.\n\n");
    push_parent(
        &mut buf,
        ctx.parent.as_ref(),
        Level::Feature,
        "User value",
        |p| p.user_value.as_deref(),
    );
    push_request(&mut buf, ctx);
    if ctx.user_role.is_some() || ctx.goal.is_some() {
        buf.push_str("Hints from the requester:\n");
        push_line(&mut buf, "- User role", ctx.user_role.as_deref());
        push_line(&mut buf, "- Goal", ctx.goal.as_deref());
        buf.push('\n');
    }
    buf.push_str(
        r#"Return a JSON object with exactly these fields:
{
  "title": "short story title, at most 80 characters",
  "description": "As a <role>, I want <capability>, so that <benefit>",
  "acceptanceCriteria": ["3 to 5 testable criteria"],
  "priority": "one of low, medium, high, critical",
  "storyPoints": "size estimate, one of 1, 2, 3, 5, 8, 13",
  "persona": "the user persona this story serves",
  "problemStatement": "the user problem being solved",
  "businessValue": "why delivering this matters to the business",
  "assumptions": ["assumptions the story relies on"],
  "risks": ["risks that could block or derail delivery"],
  "technicalNotes": "implementation hints for the team",
  "dependencies": ["other work this story depends on"],
  "storyType": "one of feature, enhancement, bug, spike, chore",
  "tags": ["short lowercase labels"],
  "definitionOfReady": ["checklist items that must hold before work starts"],
  "definitionOfDone": ["checklist items that must hold before the story is closed"],
  "confidenceLevel": "one of low, medium, high",
  "customerJourneyStage": "one of discover, onboard, engage, retain, support"
}"#,
    );
    buf
}
