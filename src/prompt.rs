//! Prompt rendering for agent sessions
//!
//! Templates are external collaborators: a run may override them from a
//! directory, and the embedded defaults only encode the gate protocol the
//! core enforces anyway. Substitution is plain string replacement of
//! `{{SPEC_SLUG}}`, `{{TARGET_BRANCH}}` and `{{FEATURE_BRANCH}}` markers, so
//! those patterns must not appear in template prose.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::StoreError;
use crate::types::{Phase, WorkspaceInfo};

const INITIALIZER_TEMPLATE: &str = include_str!("templates/initializer.md");
const CODING_TEMPLATE: &str = include_str!("templates/coding.md");
const MR_TEMPLATE: &str = include_str!("templates/mr.md");

/// Loads per-phase prompt templates, preferring an override directory.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    templates_dir: Option<Utf8PathBuf>,
}

impl PromptLibrary {
    #[must_use]
    pub fn new(templates_dir: Option<Utf8PathBuf>) -> Self {
        Self { templates_dir }
    }

    fn template_for(&self, phase: Phase) -> Result<String, StoreError> {
        let name = match phase {
            Phase::Initializer => "initializer.md",
            Phase::Coding => "coding.md",
            Phase::Mr => "mr.md",
            Phase::Done => "coding.md", // never rendered; sessions stop at done
        };
        if let Some(dir) = &self.templates_dir {
            let path = dir.join(name);
            if path.exists() {
                return std::fs::read_to_string(&path)
                    .map_err(|e| StoreError::io("read", path.as_str(), e));
            }
        }
        Ok(match phase {
            Phase::Initializer => INITIALIZER_TEMPLATE.to_string(),
            Phase::Mr => MR_TEMPLATE.to_string(),
            Phase::Coding | Phase::Done => CODING_TEMPLATE.to_string(),
        })
    }

    /// Render the session prompt for a phase.
    pub fn render(
        &self,
        phase: Phase,
        info: &WorkspaceInfo,
        extra_context: Option<&str>,
    ) -> Result<String, StoreError> {
        let template = self.template_for(phase)?;
        let workspace = format!("{}-{}", info.spec_slug, info.spec_hash);
        let mut prompt = template
            .replace("{{SPEC_SLUG}}", &workspace)
            .replace("{{TARGET_BRANCH}}", &info.target_branch)
            .replace("{{FEATURE_BRANCH}}", &info.feature_branch);
        if let Some(extra) = extra_context {
            prompt.push_str("\n\n## Session context\n\n");
            prompt.push_str(extra);
            prompt.push('\n');
        }
        Ok(prompt)
    }
}

/// Validate that an override directory exists when configured.
pub fn check_templates_dir(dir: &Utf8Path) -> Result<(), StoreError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(StoreError::NotFound {
            path: dir.to_string(),
        })
    }
}
