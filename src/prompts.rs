//! Prompt rendering for the chat-completion inference backend.

use crate::gateway::Message;
use crate::types::{BatchRequest, Requirement};

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

pub const BATCH_TEMPLATE_SLUG: &str = "batch_mapping_v1";

/// Escape XML special characters so requirement text cannot close our tags.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

const SYSTEM_PROMPT: &str = "\
You map security benchmark requirements onto a catalog of automated check functions.

For every <requirement> you are given, decide:
- which catalog functions already check it (use names exactly as listed in <catalog>);
- how completely those functions, plus any new ones you propose, cover it;
- which new functions are needed, if any.

Naming rules for new functions:
- lowercase snake_case of the form <service>_<resource>_<condition>, at least three segments
  (for example s3_bucket_default_encryption_enabled);
- never reuse a name that is already in the catalog;
- a name may be proposed for more than one requirement only when you also list it as the
  new_name of a consolidation.

Coverage is an integer from 1 (no meaningful automated coverage) to 10 (fully automated).
Use the string \"manual_only\" only for requirements marked Manual that no function can check,
and then leave both function lists empty.

Respond with a JSON array containing exactly one object per requirement, in the order given:
[
  {
    \"requirement_id\": \"<id>\",
    \"existing_functions\": [\"<catalog name>\", ...],
    \"coverage\": <1-10 or \"manual_only\">,
    \"new_functions\": [{\"name\": \"...\", \"service\": \"...\", \"api\": \"...\", \"rationale\": \"...\"}],
    \"rename_suggestions\": [{\"old_name\": \"...\", \"new_name\": \"...\"}],
    \"consolidation_suggestions\": [{\"old_names\": [\"...\"], \"new_name\": \"...\"}],
    \"notes\": \"...\"
  }
]
Return only the JSON array.";

/// Render the prompt for one batch.
pub fn render_batch_prompt(request: &BatchRequest) -> PromptInstance {
    let mut user = String::new();

    user.push_str("<catalog>\n");
    for name in &request.catalog_names {
        user.push_str(&escape_xml_chars(name));
        user.push('\n');
    }
    user.push_str("</catalog>\n\n");

    user.push_str(&format!(
        "<requirements count=\"{}\">\n",
        request.requirements.len()
    ));
    for requirement in &request.requirements {
        render_requirement(&mut user, requirement);
    }
    user.push_str("</requirements>\n");

    PromptInstance {
        template_slug: BATCH_TEMPLATE_SLUG,
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn render_requirement(out: &mut String, requirement: &Requirement) {
    out.push_str(&format!(
        "<requirement id=\"{}\" assessment=\"{}\">\n",
        escape_xml_chars(&requirement.id),
        requirement.assessment_kind.as_str()
    ));
    out.push_str(&format!(
        "<title>{}</title>\n",
        escape_xml_chars(&requirement.title)
    ));
    for (key, value) in &requirement.context {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => continue,
            other => other.to_string(),
        };
        if text.trim().is_empty() {
            continue;
        }
        let tag = escape_xml_chars(key);
        out.push_str(&format!(
            "<field name=\"{tag}\">{}</field>\n",
            escape_xml_chars(text.trim())
        ));
    }
    if !requirement.existing_function_names.is_empty() {
        out.push_str("<currently_mapped>");
        out.push_str(&escape_xml_chars(
            &requirement.existing_function_names.join(", "),
        ));
        out.push_str("</currently_mapped>\n");
    }
    out.push_str("</requirement>\n");
}
