//! Prompt size budgeting.
//!
//! Size is approximated at four characters per token. An oversized stack is
//! reduced section by section, least authoritative first, each section being
//! cut to fixed fractions of its original length from the end it can spare.
//! If that is not enough, the original stack is truncated to the soft budget
//! with the most authoritative sections served first, so instructions and the
//! player's message survive whole while bulky context is cut.

use serde::Serialize;

use merlin_core::prompt::{KeepEnd, PromptPart, PromptSection, PromptStack, SectionKind};

pub const CHARS_PER_TOKEN: usize = 4;

/// Percentages of a section's original length tried in turn.
const SHRINK_STEPS: [usize; 4] = [75, 50, 35, 25];

/// Least authoritative first.
const PRUNE_ORDER: [SectionKind; 7] = [
    SectionKind::History,
    SectionKind::Story,
    SectionKind::Character,
    SectionKind::Task,
    SectionKind::UserInput,
    SectionKind::Developer,
    SectionKind::System,
];

/// What `apply_budget` did to a stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReport {
    pub applied: bool,
    pub strategy: Vec<String>,
    pub estimated_tokens: u32,
}

/// Approximate token count of text. Never below 1.
pub fn estimate_text(text: &str) -> u32 {
    tokens_for_chars(text.chars().count())
}

/// Approximate token count of a whole stack. Never below 1.
pub fn estimate(stack: &PromptStack) -> u32 {
    tokens_for_chars(stack.char_count())
}

fn tokens_for_chars(chars: usize) -> u32 {
    let tokens = chars.div_ceil(CHARS_PER_TOKEN).max(1);
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Reduce `stack` until its estimate is at most `soft_limit`.
///
/// `soft_limit` is raised to 1 and `hard_limit` to `soft_limit` when smaller.
/// The returned stack always fits the soft limit, so applying the budget to
/// its own output changes nothing.
pub fn apply_budget(
    stack: &PromptStack,
    soft_limit: u32,
    hard_limit: u32,
) -> (PromptStack, BudgetReport) {
    let soft = soft_limit.max(1);
    let hard = hard_limit.max(soft);

    let initial = estimate(stack);
    if initial <= soft {
        return (
            stack.clone(),
            BudgetReport {
                applied: false,
                strategy: Vec::new(),
                estimated_tokens: initial,
            },
        );
    }

    let originals = stack.sections();
    let mut current = stack.clone();
    let mut strategy = Vec::new();

    for kind in PRUNE_ORDER {
        for (idx, original) in originals.iter().enumerate() {
            if original.kind != kind {
                continue;
            }
            let original_chars = original.char_count();
            if original_chars == 0 {
                continue;
            }
            for pct in SHRINK_STEPS {
                let target = (original_chars * pct / 100).max(1);
                current.sections_mut()[idx] = shrink_section(original, target);
                strategy.push(format!("shrink_{}_{}", kind.as_str(), pct));

                let estimated = estimate(&current);
                if estimated <= soft {
                    return (
                        current,
                        BudgetReport {
                            applied: true,
                            strategy,
                            estimated_tokens: estimated,
                        },
                    );
                }
            }
        }
    }

    // Truncate from the original: the shrink pass above has already cut the
    // authoritative sections, which the allotment must see whole.
    // soft <= hard, so this budget never exceeds the hard limit either.
    let budget_chars = soft.min(hard) as usize * CHARS_PER_TOKEN;
    let truncated = hard_truncate(stack, budget_chars);
    strategy.push("hard_truncate".into());
    let estimated = estimate(&truncated);

    (
        truncated,
        BudgetReport {
            applied: true,
            strategy,
            estimated_tokens: estimated,
        },
    )
}

/// Keep at most `target_chars` of a section, from its keep end. Parts on the
/// far side are dropped whole; the boundary part is cut.
fn shrink_section(section: &PromptSection, target_chars: usize) -> PromptSection {
    let keep_end = section.kind.keep_end();
    let mut remaining = target_chars;
    let mut kept: Vec<PromptPart> = Vec::new();

    let mut ordered: Vec<&PromptPart> = section.parts.iter().collect();
    if keep_end == KeepEnd::Tail {
        ordered.reverse();
    }

    for part in ordered {
        if remaining == 0 {
            break;
        }
        let chars = part.char_count();
        if chars <= remaining {
            kept.push(part.clone());
            remaining -= chars;
        } else {
            kept.push(PromptPart::new(part.role, cut(&part.content, remaining, keep_end)));
            remaining = 0;
        }
    }

    if keep_end == KeepEnd::Tail {
        kept.reverse();
    }

    PromptSection {
        kind: section.kind,
        parts: kept,
    }
}

/// Serve the character budget to sections in authority order; whatever does
/// not fit is cut or dropped. Section order in the stack is preserved.
fn hard_truncate(stack: &PromptStack, budget_chars: usize) -> PromptStack {
    let sections = stack.sections();
    let mut allotted: Vec<Option<PromptSection>> = vec![None; sections.len()];
    let mut remaining = budget_chars;

    for kind in PRUNE_ORDER.iter().rev() {
        for (idx, section) in sections.iter().enumerate() {
            if section.kind != *kind || remaining == 0 {
                continue;
            }
            let chars = section.char_count();
            if chars <= remaining {
                remaining -= chars;
                allotted[idx] = Some(section.clone());
            } else {
                allotted[idx] = Some(shrink_section(section, remaining));
                remaining = 0;
            }
        }
    }

    let mut out = PromptStack::new();
    for section in allotted.into_iter().flatten() {
        if !section.parts.is_empty() {
            out.push(section);
        }
    }
    out
}

fn cut(text: &str, keep_chars: usize, keep_end: KeepEnd) -> String {
    match keep_end {
        KeepEnd::Head => text.chars().take(keep_chars).collect(),
        KeepEnd::Tail => {
            let total = text.chars().count();
            text.chars().skip(total.saturating_sub(keep_chars)).collect()
        }
    }
}
