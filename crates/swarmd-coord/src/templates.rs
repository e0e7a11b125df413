//! Prompt and brief templates.
//!
//! Rendering uses [`handlebars`], which HTML-escapes interpolations by
//! default — project text is client-supplied and ends up in dashboards, so
//! escaping at the template layer keeps every downstream surface safe.
//! Templates are total over empty inputs (`{{#each}}` over an empty list
//! renders nothing) and are exercised against large specialist pools.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{CoordError, CoordResult};
use crate::sampling::{ContextBrief, PoolEntry, SynthesisReport};

const DECOMPOSE_PROMPT: &str = "\
Decompose the following project into specialist subtasks.

Project {{task_id}} (priority {{priority}}):
{{text}}

{{#if constraints}}Constraints: {{constraints}}{{/if}}

Available specialists:
{{#each specialists}}
- {{id}} ({{kind}}) load {{current_load}}/{{max_load}}{{#if capabilities}} caps: {{#each capabilities}}{{this}} {{/each}}{{/if}}
{{/each}}

Reply with strict JSON: {\"subtasks\": [{\"id\", \"description\", \"specialist\", \"complexity\", \"estimated_minutes\", \"dependencies\"}], \"strategy\"}.
";

const EXECUTION_BRIEF: &str = "\
# Execution brief: {{subtask_id}}

**Specialist**: {{specialist}}
**Parent**: {{parent_task_id}}

## Scope
{{scope}}

{{#if mandatory_readings}}## Mandatory readings
{{#each mandatory_readings}}- {{this}}
{{/each}}{{/if}}
{{#if architecture_constraints}}## Architecture constraints
{{#each architecture_constraints}}- {{this}}
{{/each}}{{/if}}
{{#if success_criteria}}## Success criteria
{{#each success_criteria}}- {{this}}
{{/each}}{{/if}}
{{#if related_work}}## Related completed work
{{#each related_work}}- {{this}}
{{/each}}{{/if}}
";

const SYNTHESIS_SUMMARY: &str = "\
# Integration report: {{task_id}}

**Status**: {{status}}

{{#if summary}}{{summary}}

{{/if}}{{#if integration_steps}}## Integration steps
{{#each integration_steps}}1. {{this}}
{{/each}}{{/if}}
{{#if next_actions}}## Next actions
{{#each next_actions}}- {{this}}
{{/each}}{{/if}}
";

/// Compiled template set shared across the coordinator.
#[derive(Clone)]
pub struct TemplateEngine {
    registry: std::sync::Arc<Handlebars<'static>>,
}

#[derive(Serialize)]
struct DecomposePromptData<'a> {
    task_id: &'a str,
    priority: u8,
    text: &'a str,
    constraints: Option<String>,
    specialists: &'a [PoolEntry],
}

#[derive(Serialize)]
struct BriefData<'a> {
    subtask_id: &'a str,
    specialist: &'a str,
    parent_task_id: &'a str,
    #[serde(flatten)]
    brief: &'a ContextBrief,
}

#[derive(Serialize)]
struct SynthesisData<'a> {
    task_id: &'a str,
    status: String,
    #[serde(flatten)]
    report: &'a SynthesisReport,
}

impl TemplateEngine {
    pub fn new() -> CoordResult<Self> {
        let mut registry = Handlebars::new();
        // Absent optional fields render as empty rather than erroring.
        registry.set_strict_mode(false);
        for (name, template) in [
            ("decompose_prompt", DECOMPOSE_PROMPT),
            ("execution_brief", EXECUTION_BRIEF),
            ("synthesis_summary", SYNTHESIS_SUMMARY),
        ] {
            registry
                .register_template_string(name, template)
                .map_err(|e| CoordError::TemplateRegistration(e.to_string()))?;
        }
        Ok(Self {
            registry: std::sync::Arc::new(registry),
        })
    }

    /// The decomposition prompt shown to the sampling provider.
    pub fn decompose_prompt(
        &self,
        task_id: &str,
        text: &str,
        priority: u8,
        constraints: Option<&serde_json::Value>,
        specialists: &[PoolEntry],
    ) -> CoordResult<String> {
        let data = DecomposePromptData {
            task_id,
            priority,
            text,
            constraints: constraints.map(|c| c.to_string()),
            specialists,
        };
        Ok(self.registry.render("decompose_prompt", &data)?)
    }

    /// The per-subtask execution brief stored as a context attachment.
    pub fn execution_brief(
        &self,
        subtask_id: &str,
        specialist: &str,
        parent_task_id: &str,
        brief: &ContextBrief,
    ) -> CoordResult<String> {
        let data = BriefData {
            subtask_id,
            specialist,
            parent_task_id,
            brief,
        };
        Ok(self.registry.render("execution_brief", &data)?)
    }

    /// The markdown integration report attached to a synthesized parent.
    pub fn synthesis_summary(
        &self,
        task_id: &str,
        report: &SynthesisReport,
    ) -> CoordResult<String> {
        let status = serde_json::to_value(report.status)?
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let data = SynthesisData {
            task_id,
            status,
            report,
        };
        Ok(self.registry.render("synthesis_summary", &data)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
