use serde::Serialize;
use tera::{Context, Error as TeraError, Tera};

use crate::registry::ToolSnapshot;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

#[derive(Serialize)]
struct ToolInstruction<'a> {
    name: &'a str,
    context: &'a str,
}

#[derive(Serialize)]
struct SystemPromptContext<'a> {
    base: &'a str,
    tools: Vec<ToolInstruction<'a>>,
}

/// The system message for a turn: the base instruction followed by the effective
/// context of every tool enabled in `tools`
pub fn system_prompt(base: &str, tools: &ToolSnapshot) -> Result<String, TeraError> {
    let context = SystemPromptContext {
        base,
        tools: tools
            .enabled()
            .filter(|t| !t.effective_context().trim().is_empty())
            .map(|t| ToolInstruction {
                name: &t.name,
                context: t.effective_context(),
            })
            .collect(),
    };
    let rendered = load_prompt(SYSTEM_TEMPLATE, &context)?;
    Ok(rendered.trim_end().to_string())
}
