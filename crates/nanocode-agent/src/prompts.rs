//! System prompt for the agent loop.

use nanocode_core::ParserMode;
use nanocode_tools::registry::TOOL_SPECS;
use std::path::Path;

const GLM_SYNTAX: &str = "To call a tool, write a block like:
<tool_call>read
<arg_key>path</arg_key>
<arg_value>src/main.rs</arg_value>
</tool_call>
One block per call. Several blocks may follow each other.";

const JSON_FENCE_SYNTAX: &str = "To call a tool, write a fenced block like:
```tool_call
{\"name\": \"read\", \"arguments\": {\"path\": \"src/main.rs\"}}
```
One object per call, or an array of objects to make several calls.";

/// Builds the system prompt. Text grammars also get the call syntax and the
/// tool list, since the model cannot see the function definitions there.
pub fn build_system_prompt(workspace: &Path, mode: ParserMode) -> String {
    let mut prompt = format!("Concise coding assistant. cwd: {}", workspace.display());
    let syntax = match mode {
        ParserMode::Native => return prompt,
        ParserMode::Glm => GLM_SYNTAX,
        ParserMode::JsonFence => JSON_FENCE_SYNTAX,
    };
    prompt.push_str("\n\n# Tools\n\n");
    prompt.push_str(syntax);
    prompt.push_str("\n\nAvailable tools:\n");
    for spec in &TOOL_SPECS {
        prompt.push_str(&format!("- {}: {}\n", spec.signature(), spec.description));
    }
    prompt.push_str("\nWait for tool results before answering. Reply without a tool call when done.");
    prompt
}
