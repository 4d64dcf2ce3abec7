use crate::diff::DiffChunk;

const WRAP_INSTRUCTION: &str = "Limit each line in the commit body to 72 characters; wrap at sentence boundaries (e.g. after a period and space) when possible so lines do not break mid-sentence.\n";

/// Pieces of a single-message prompt.
pub struct PromptOptions<'a> {
    pub skill_text: &'a str,
    pub diff: &'a str,
    pub extra_note: &'a str,
    pub no_cc: bool,
}

fn preamble(no_cc: bool, out: &mut String) {
    if no_cc {
        out.push_str("Generate a commit message from the staged git diff.\n");
    } else {
        out.push_str("Generate a Conventional Commit message from the staged git diff.\n");
    }
    out.push_str("Use the instructions below and output only the commit message.\n");
    out.push_str(WRAP_INSTRUCTION);
    out.push('\n');
}

fn push_extra_note(extra_note: &str, out: &mut String) {
    let note = extra_note.trim();
    if !note.is_empty() {
        out.push_str("\nExtra context:\n");
        out.push_str(note);
        out.push('\n');
    }
}

/// Backend-agnostic prompt: instructions, rules, the diff, and the extra
/// note when it is not blank.
pub fn build_prompt(opts: &PromptOptions<'_>) -> String {
    let mut prompt = String::with_capacity(opts.skill_text.len() + opts.diff.len() + 512);
    preamble(opts.no_cc, &mut prompt);
    prompt.push_str("Instructions:\n");
    prompt.push_str(opts.skill_text);
    prompt.push_str("\n\n");
    prompt.push_str("Staged diff:\n");
    prompt.push_str(opts.diff);
    prompt.push('\n');
    push_extra_note(opts.extra_note, &mut prompt);
    prompt
}

/// The stable half of a split prompt. Identical across runs with the same
/// rules, so backends with prompt caching can reuse it.
pub fn build_system_prompt(skill_text: &str, no_cc: bool) -> String {
    let mut prompt = String::with_capacity(skill_text.len() + 512);
    preamble(no_cc, &mut prompt);
    prompt.push_str("Instructions:\n");
    prompt.push_str(skill_text);
    prompt
}

/// The variable half of a split prompt: one user turn per diff chunk, then
/// a closing turn that asks for the message and carries the extra note.
pub fn build_chunk_turns(chunks: &[DiffChunk], extra_note: &str) -> Vec<String> {
    let mut turns: Vec<String> = chunks
        .iter()
        .map(|chunk| format!("Staged diff for {}:\n{}", chunk.dir, chunk.diff))
        .collect();

    let mut last = String::from("Generate the commit message based on all the staged diffs above.");
    let note = extra_note.trim();
    if !note.is_empty() {
        last.push_str("\n\nExtra context:\n");
        last.push_str(note);
    }
    turns.push(last);
    turns
}
