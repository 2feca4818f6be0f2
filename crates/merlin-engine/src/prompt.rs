//! Prompt assembly from session context.

use merlin_core::prompt::{PromptSection, PromptStack, Role, SectionKind};
use merlin_core::repository::{SessionSnapshot, TurnContext};

const PERSONA: &str = "You are the Dungeon Master of a solo tabletop adventure. \
Narrate in second person, stay in character and keep the world consistent.";

const STYLE_RULES: &str = "Keep replies under 200 words. Never decide the player's \
actions for them. Describe consequences, then offer a clear moment to act.";

const TASK: &str = "Narrate the outcome of the player's latest action and end by \
inviting their next move.";

/// Build the full stack for one turn. `history` must be oldest first and must
/// not include `user_input`.
pub fn assemble(context: &TurnContext, user_input: &str) -> PromptStack {
    let mut stack = PromptStack::new()
        .with(PromptSection::text(SectionKind::System, PERSONA))
        .with(PromptSection::text(SectionKind::Developer, STYLE_RULES))
        .with(PromptSection::text(SectionKind::Story, story_block(&context.session)));

    if let Some(sheet) = context
        .session
        .character_sheet
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        stack.push(PromptSection::text(SectionKind::Character, sheet));
    }

    if !context.history.is_empty() {
        let history = context
            .history
            .iter()
            .fold(PromptSection::new(SectionKind::History), |section, message| {
                section.with_part(message.role, message.content.clone())
            });
        stack.push(history);
    }

    stack
        .with(PromptSection::new(SectionKind::UserInput).with_part(Role::User, user_input))
        .with(PromptSection::text(SectionKind::Task, TASK))
}

fn story_block(session: &SessionSnapshot) -> String {
    let mut lines = vec![format!("Adventure: {}", session.title)];
    if let Some(brief) = session.story_brief.as_deref() {
        lines.push(format!("Premise: {brief}"));
    }
    if let Some(summary) = session.status_summary.as_deref() {
        lines.push(format!("So far: {summary}"));
    }
    if let Some(location) = session.location.as_deref() {
        lines.push(format!("Location: {location}"));
    }
    if session.in_combat {
        lines.push("The party is in combat.".to_string());
    }
    lines.join("\n")
}

/// Narration stored as the first assistant message of a new session: the
/// greeting, then the story brief and the starting status when known.
pub fn opening_message(
    character_name: Option<&str>,
    title: &str,
    story_brief: Option<&str>,
    status_summary: Option<&str>,
) -> String {
    let name = character_name.unwrap_or("traveler");
    let mut text = format!("Greetings, {name}! Welcome to {title}!");
    for extra in [story_brief, status_summary].into_iter().flatten() {
        let extra = extra.trim();
        if !extra.is_empty() {
            text.push(' ');
            text.push_str(extra);
        }
    }
    text.push_str(" How do you proceed, adventurer?");
    text
}

/// Static reply used while the generation backend is presumed unhealthy.
pub fn degraded_reply(cooldown_seconds: u64) -> String {
    format!("The DM is catching their breath (cooldown {cooldown_seconds}s).")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use merlin_core::ids::SessionId;
    use merlin_core::repository::StoredMessage;

    fn context(history: Vec<StoredMessage>, sheet: Option<&str>) -> TurnContext {
        TurnContext {
            session: SessionSnapshot {
                session_id: SessionId::from_raw("sess_1"),
                title: "The Sunken Keep".into(),
                character_name: Some("Elara".into()),
                story_brief: Some("A keep swallowed by the marsh.".into()),
                status_summary: None,
                location: Some("Gatehouse".into()),
                in_combat: true,
                character_sheet: sheet.map(str::to_string),
            },
            history,
        }
    }

    fn message(id: i64, role: Role, content: &str) -> StoredMessage {
        StoredMessage {
            id,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sections_follow_send_order() {
        let ctx = context(
            vec![message(1, Role::Assistant, "Welcome."), message(2, Role::User, "Hi")],
            Some("Elara, level 3 ranger"),
        );
        let stack = assemble(&ctx, "I draw my bow.");
        let kinds: Vec<SectionKind> = stack.sections().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                SectionKind::System,
                SectionKind::Developer,
                SectionKind::Story,
                SectionKind::Character,
                SectionKind::History,
                SectionKind::UserInput,
                SectionKind::Task,
            ]
        );
        assert!(stack.has_instruction());
    }

    #[test]
    fn history_keeps_roles_and_order() {
        let ctx = context(
            vec![message(1, Role::Assistant, "Welcome."), message(2, Role::User, "Hi")],
            None,
        );
        let stack = assemble(&ctx, "Onward");
        let history = stack.section(SectionKind::History).unwrap();
        assert_eq!(history.parts[0].role, Role::Assistant);
        assert_eq!(history.parts[1].content, "Hi");
        let input = stack.section(SectionKind::UserInput).unwrap();
        assert_eq!(input.parts[0].role, Role::User);
        assert_eq!(input.parts[0].content, "Onward");
    }

    #[test]
    fn optional_sections_are_skipped() {
        let stack = assemble(&context(Vec::new(), Some("  ")), "Look");
        assert!(stack.section(SectionKind::Character).is_none());
        assert!(stack.section(SectionKind::History).is_none());
    }

    #[test]
    fn story_block_mentions_session_facts() {
        let stack = assemble(&context(Vec::new(), None), "Look");
        let story = &stack.section(SectionKind::Story).unwrap().parts[0].content;
        assert!(story.contains("The Sunken Keep"));
        assert!(story.contains("Gatehouse"));
        assert!(story.contains("combat"));
    }

    #[test]
    fn opening_message_greets_character() {
        let text = opening_message(
            Some("Elara"),
            "The Sunken Keep",
            Some("Mist rises."),
            Some("You stand at the drawbridge, sword drawn."),
        );
        assert_eq!(
            text,
            "Greetings, Elara! Welcome to The Sunken Keep! Mist rises. \
             You stand at the drawbridge, sword drawn. How do you proceed, adventurer?"
        );
        let anonymous = opening_message(None, "Somewhere", None, Some("  "));
        assert_eq!(
            anonymous,
            "Greetings, traveler! Welcome to Somewhere! How do you proceed, adventurer?"
        );
    }

    #[test]
    fn degraded_reply_mentions_cooldown() {
        assert_eq!(
            degraded_reply(42),
            "The DM is catching their breath (cooldown 42s)."
        );
    }
}
