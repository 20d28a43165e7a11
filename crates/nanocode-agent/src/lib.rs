pub mod conversation;
pub mod parser;
pub mod prompts;
pub mod tool_loop;

pub use conversation::{ConversationError, ConversationState};
pub use parser::{ParseOutput, ToolCallParser, parse_native_calls};
pub use prompts::build_system_prompt;
pub use tool_loop::{
    AgentError, AgentLoop, EventCallback, LoopConfig, LoopEvent, ToolCallRecord, TurnReport,
    summarize_args,
};
