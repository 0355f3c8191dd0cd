pub mod edit_file;
pub mod execute_command;
pub mod file_structure;
pub mod get_file_structure;
pub mod grep;
pub mod list_files;
pub mod read_file;
pub mod spawn_sub_agent;
pub mod submit_task;
pub mod todo;
pub mod user_query;
pub mod web_search;

pub use edit_file::EditFileTool;
pub use execute_command::ExecuteCommandTool;
pub use get_file_structure::GetFileStructureTool;
pub use grep::GrepTool;
pub use list_files::ListFilesTool;
pub use read_file::ReadFileTool;
pub use spawn_sub_agent::SpawnSubAgentTool;
pub use submit_task::SubmitTaskTool;
pub use todo::UpdateTodoListTool;
pub use user_query::UserQueryTool;
pub use web_search::WebSearchTool;

use std::sync::Arc;

use crate::tools::Tool;

/// Name of the tool excluded from sub-agent tool sets.
pub const SPAWN_SUB_AGENT: &str = "spawn_sub_agent";

/// Returns all builtin tools. This is the canonical source of truth for
/// which tools are built in.
pub fn all_builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(EditFileTool::new()),
        Arc::new(ExecuteCommandTool::new()),
        Arc::new(GetFileStructureTool::new()),
        Arc::new(GrepTool::new()),
        Arc::new(ListFilesTool::new()),
        Arc::new(ReadFileTool::new()),
        Arc::new(SpawnSubAgentTool::new()),
        Arc::new(SubmitTaskTool::new()),
        Arc::new(UpdateTodoListTool::new()),
        Arc::new(UserQueryTool::new()),
        Arc::new(WebSearchTool::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_covers_required_tools() {
        let names: Vec<String> = all_builtin_tools().iter().map(|t| t.name().to_string()).collect();
        for required in [
            "read_file",
            "edit_file",
            "list_files",
            "grep",
            "execute_command",
            "get_file_structure",
            "update_todo_list",
            "submit_task",
            "user_query",
            "spawn_sub_agent",
            "web_search",
        ] {
            assert!(names.contains(&required.to_string()), "{} missing", required);
        }
    }
}
