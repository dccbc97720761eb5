// Llama 2 chat template rendering

use crate::dialog::Dialog;

pub const B_INST: &str = "[INST]";
pub const E_INST: &str = "[/INST]";
pub const B_SYS: &str = "<<SYS>>\n";
pub const E_SYS: &str = "\n<</SYS>>\n\n";
const BOS: &str = "<s>";
const EOS: &str = "</s>";

const SPECIAL_TAGS: [&str; 4] = [B_INST, E_INST, "<<SYS>>", "<</SYS>>"];

/// Generation returned in place of a completion when a dialog smuggles template tags.
pub const UNSAFE_PROMPT_ERROR: &str = "Error: special tags are not allowed as part of the prompt.";

/// True if any message carries one of the reserved template tags.
pub fn contains_special_tags(dialog: &Dialog) -> bool {
    dialog
        .iter()
        .any(|m| SPECIAL_TAGS.iter().any(|tag| m.content.contains(tag)))
}

/// Render a validated dialog into a single Llama 2 chat prompt.
///
/// A leading system message is folded into the first user turn. Each
/// completed user/assistant pair is wrapped in its own `<s>...</s>` block and
/// the trailing user turn is left open for the model to answer.
pub fn render_llama2(dialog: &Dialog) -> String {
    let (system, turns) = dialog.split_system();

    let mut contents: Vec<String> = turns.iter().map(|m| m.content.clone()).collect();
    if let (Some(sys), Some(first)) = (system, contents.first_mut()) {
        *first = format!("{B_SYS}{}{E_SYS}{}", sys.content, first);
    }

    let mut prompt = String::new();
    let mut pairs = contents.chunks_exact(2);
    for pair in pairs.by_ref() {
        prompt.push_str(&format!(
            "{BOS}{B_INST} {} {E_INST} {} {EOS}",
            pair[0].trim(),
            pair[1].trim()
        ));
    }
    if let [last] = pairs.remainder() {
        prompt.push_str(&format!("{BOS}{B_INST} {} {E_INST}", last.trim()));
    }
    prompt
}
