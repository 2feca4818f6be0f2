use serde_json::{json, Value};

use merlin_core::prompt::{PromptStack, Role};
use merlin_core::provider::GenerateOptions;

const JSON_INSTRUCTION: &str = "Respond with a single JSON object.";
const CONVERSATION_START: &str = "Begin.";

fn openai_role(role: Role) -> &'static str {
    match role {
        Role::System | Role::Developer => "system",
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

/// Chat Completions request body for a prompt stack.
pub fn build_openai_body(stack: &PromptStack, options: &GenerateOptions, model: &str) -> Value {
    let messages: Vec<Value> = stack
        .parts()
        .map(|part| json!({ "role": openai_role(part.role), "content": part.content }))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": options.temperature,
        "max_tokens": options.max_output_tokens,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if options.json_mode {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

/// Messages API request body. Instruction parts move into `system`; the
/// remaining parts are merged into alternating user/assistant turns that
/// start with the user.
pub fn build_anthropic_body(stack: &PromptStack, options: &GenerateOptions, model: &str) -> Value {
    let mut system: Vec<&str> = Vec::new();
    let mut turns: Vec<(&'static str, String)> = Vec::new();

    for part in stack.parts() {
        let role = match part.role {
            Role::System | Role::Developer => {
                system.push(&part.content);
                continue;
            }
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };
        match turns.last_mut() {
            Some((last_role, content)) if *last_role == role => {
                content.push_str("\n\n");
                content.push_str(&part.content);
            }
            _ => turns.push((role, part.content.clone())),
        }
    }
    if turns.first().is_some_and(|(role, _)| *role == "assistant") {
        turns.insert(0, ("user", CONVERSATION_START.to_string()));
    }
    if options.json_mode {
        system.push(JSON_INSTRUCTION);
    }

    let messages: Vec<Value> = turns
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": options.temperature,
        "max_tokens": options.max_output_tokens,
        "stream": true,
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    body
}
