//! Inject the token-budgeted project overview after the system prompt.

use async_trait::async_trait;
use atelier::chat::ChatProvider;

use crate::error::AgentError;
use crate::overview::{PROJECT_OVERVIEW_TOKEN_TARGET, apply_project_overview};
use crate::preprocess::{Preprocessor, PromptContext};

pub struct ProjectContextPreprocessor {
    token_target: usize,
}

impl ProjectContextPreprocessor {
    pub fn new() -> Self {
        Self {
            token_target: PROJECT_OVERVIEW_TOKEN_TARGET,
        }
    }
}

impl Default for ProjectContextPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Preprocessor for ProjectContextPreprocessor {
    fn name(&self) -> &str {
        "project_context"
    }

    fn priority(&self) -> u8 {
        15
    }

    async fn process(
        &self,
        ctx: &mut PromptContext,
        _provider: &dyn ChatProvider,
    ) -> Result<(), AgentError> {
        let project_path = ctx.project_path.clone();
        apply_project_overview(&mut ctx.messages, project_path.as_deref(), self.token_target);
        Ok(())
    }
}
