use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub bot_name: &'a str,
    pub brand_name: &'a str,
    pub persona: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            bot_name => display_or(ctx.bot_name, "Support Bot"),
            brand_name => display_or(ctx.brand_name, "this workspace"),
            persona => ctx.persona.trim(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {} for {}.\n\
         Be accurate, concise, and practical. Never invent facts.\n\
         If the visitor asks for a human, say you are connecting them with a person.\n",
        display_or(ctx.bot_name, "Support Bot"),
        display_or(ctx.brand_name, "this workspace"),
    );

    if !ctx.persona.trim().is_empty() {
        prompt.push_str("\nPersona notes:\n");
        prompt.push_str(ctx.persona.trim());
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_names_into_prompt() {
        let prompt = render_system_prompt(&SystemPromptContext {
            bot_name: "Relay Bot",
            brand_name: "Acme",
            persona: "",
        });
        assert!(prompt.contains("Relay Bot"));
        assert!(prompt.contains("Acme"));
        assert!(!prompt.contains("Persona notes"));
    }

    #[test]
    fn blank_names_fall_back() {
        let prompt = render_system_prompt(&SystemPromptContext {
            bot_name: "  ",
            brand_name: "",
            persona: "friendly, brief",
        });
        assert!(prompt.contains("Support Bot"));
        assert!(prompt.contains("friendly, brief"));
    }
}
