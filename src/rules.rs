use std::path::Path;

/// Conventional Commits 1.0.0, from conventionalcommits.org.
pub const CONVENTIONAL_SPEC: &str = include_str!("rules/conventional_commits.md");

/// Used instead of the Conventional Commits text when `GIT_AI_NO_CC` is set.
pub const STANDARD_COMMIT_RULE: &str = include_str!("rules/standard_commit.md");

/// Rules text for the prompt, plus any extra instructions from a skill file.
///
/// A missing, unreadable or blank skill file is not an error; the base rules
/// are used on their own.
pub fn skill_text(no_cc: bool, skill_path: Option<&Path>) -> String {
    let mut text = if no_cc {
        STANDARD_COMMIT_RULE.to_string()
    } else {
        CONVENTIONAL_SPEC.to_string()
    };

    let Some(path) = skill_path else {
        return text;
    };
    match std::fs::read_to_string(path) {
        Ok(extra) if !extra.trim().is_empty() => {
            text.push_str("\nAdditional instructions:\n");
            text.push_str(extra.trim());
        }
        Ok(_) => tracing::debug!(path = %path.display(), "skill file is blank"),
        Err(e) => tracing::warn!(path = %path.display(), "ignoring unreadable skill file: {e}"),
    }
    text
}
