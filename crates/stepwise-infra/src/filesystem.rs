//! Data directory layout and workflow file discovery.
//!
//! ```text
//! ~/.stepwise/
//!   config.toml
//!   stepwise.db
//!   vault.enc / vault.key
//!   workflows.yaml
//!   workflows/**/*.yaml
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stepwise_core::workflow::WorkflowError;
use stepwise_core::workflow::definition::{discover_workflows, load_workflow_file};
use stepwise_types::workflow::WorkflowDefinition;

pub const WORKFLOW_FILE: &str = "workflows.yaml";
pub const WORKFLOW_DIR: &str = "workflows";

/// Resolve the data directory.
///
/// Priority: `STEPWISE_DATA_DIR`, then `~/.stepwise`, then `./.stepwise`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWISE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }

    PathBuf::from(".stepwise")
}

/// The primary workflow file: an explicit path, else `./workflows.yaml`,
/// else `{data_dir}/workflows.yaml`. `None` if nothing exists.
pub fn resolve_workflow_file(explicit: Option<&Path>, data_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    [PathBuf::from(WORKFLOW_FILE), data_dir.join(WORKFLOW_FILE)]
        .into_iter()
        .find(|p| p.is_file())
}

/// Load every workflow visible from `data_dir`.
///
/// The primary file must parse; an explicit path that does not exist is an
/// error. Files under `{data_dir}/workflows/` are best-effort: bad files
/// are skipped, and a name already taken by the primary file is ignored.
pub fn load_workflows(
    explicit: Option<&Path>,
    data_dir: &Path,
) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
    let mut workflows = match resolve_workflow_file(explicit, data_dir) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading workflow file");
            load_workflow_file(&path)?
        }
        None => Vec::new(),
    };

    let mut names: HashSet<String> = workflows.iter().map(|w| w.name.clone()).collect();
    for (path, def) in discover_workflows(&data_dir.join(WORKFLOW_DIR))? {
        if names.insert(def.name.clone()) {
            workflows.push(def);
        } else {
            tracing::warn!(
                path = %path.display(),
                workflow = %def.name,
                "workflow name already defined, skipping"
            );
        }
    }
    Ok(workflows)
}
