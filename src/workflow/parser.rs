//! Template Loader
//!
//! Loads a template directory of workflow YAML files. The expected
//! layout is `<templates_dir>/<template>/<tool>/<name>.yaml`, giving the
//! workflow key `{tool}_{name}`.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::model::{Template, Workflow, WorkflowKey};
use crate::error::LoadError;

/// Loads and validates every workflow of a template.
///
/// # Example
///
/// ```rust,no_run
/// use reconflow::workflow::load_template;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let template = load_template("workflows", "default")?;
///     println!("Loaded {} workflows", template.len());
///     Ok(())
/// }
/// ```
pub fn load_template(
    templates_dir: impl AsRef<Path>,
    template: &str,
) -> Result<Template, LoadError> {
    let templates_dir = templates_dir.as_ref();
    let root = templates_dir.join(template);
    info!("Loading template '{}' from {}", template, root.display());

    if !root.is_dir() {
        return Err(LoadError::TemplateNotFound {
            template: template.to_string(),
            dir: templates_dir.to_path_buf(),
        });
    }

    let mut loaded = Template::new(template);

    for tool_dir in sorted_entries(&root)? {
        if !tool_dir.is_dir() {
            continue;
        }
        let tool = file_name(&tool_dir)?;

        for path in sorted_entries(&tool_dir)? {
            if !is_yaml(&path) {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| LoadError::InvalidFileName(path.clone()))?;

            let key = WorkflowKey::new(tool.clone(), name);
            let workflow = load_workflow_file(&path)?;
            validate_steps(&key, &workflow)?;

            debug!(
                "Loaded workflow '{}' ({} steps, requires {:?})",
                key,
                workflow.steps.len(),
                workflow.requires
            );
            loaded.insert(key, workflow);
        }
    }

    if loaded.is_empty() {
        return Err(LoadError::EmptyTemplate(template.to_string()));
    }

    info!("Template '{}': {} workflows", template, loaded.len());
    Ok(loaded)
}

/// Parses a single workflow YAML file.
pub fn load_workflow_file(path: &Path) -> Result<Workflow, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", content.len());

    serde_yaml::from_str(&content).map_err(|source| LoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Every step needs a tool and at least one argument form.
fn validate_steps(key: &WorkflowKey, workflow: &Workflow) -> Result<(), LoadError> {
    if workflow.steps.is_empty() {
        return Err(LoadError::InvalidStep {
            workflow: key.to_string(),
            index: 0,
            reason: "workflow has no steps".to_string(),
        });
    }

    for (index, step) in workflow.steps.iter().enumerate() {
        if step.tool.trim().is_empty() {
            return Err(LoadError::InvalidStep {
                workflow: key.to_string(),
                index,
                reason: "no tool specified".to_string(),
            });
        }
        if !step.has_args() {
            return Err(LoadError::InvalidStep {
                workflow: key.to_string(),
                index,
                reason: "needs `args` or `args_sudo`/`args_normal`".to_string(),
            });
        }
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let io_err = |source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> Result<String, LoadError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| LoadError::InvalidFileName(path.to_path_buf()))
}

fn is_yaml(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_template_keys() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "basic/naabu/port_discovery.yaml",
            "steps:\n  - tool: naabu\n    args: [\"-host\", \"{{target}}\", \"-json\"]\nprovides: discovered_ports\n",
        );
        write(
            dir.path(),
            "basic/nmap/deep.yml",
            "requires: [port_discovery]\nsteps:\n  - tool: nmap\n    args_sudo: [\"-sS\"]\n    args_normal: [\"-sT\"]\n",
        );
        write(dir.path(), "basic/nmap/README.txt", "ignored");

        let template = load_template(dir.path(), "basic").unwrap();
        assert_eq!(template.len(), 2);

        let keys: Vec<String> = template.workflows.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["naabu_port_discovery", "nmap_deep"]);

        let deep = &template.workflows[&WorkflowKey::new("nmap", "deep")];
        assert_eq!(deep.requires, vec!["port_discovery"]);
    }

    #[test]
    fn test_missing_template() {
        let dir = tempdir().unwrap();
        let err = load_template(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, LoadError::TemplateNotFound { .. }));
    }

    #[test]
    fn test_empty_template() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("empty/nmap")).unwrap();
        let err = load_template(dir.path(), "empty").unwrap_err();
        assert!(matches!(err, LoadError::EmptyTemplate(_)));
    }

    #[test]
    fn test_step_without_args_rejected() {
        let dir = tempdir().unwrap();
        write(dir.path(), "t/nmap/quick.yaml", "steps:\n  - tool: nmap\n");

        let err = load_template(dir.path(), "t").unwrap_err();
        assert!(matches!(err, LoadError::InvalidStep { index: 0, .. }));
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempdir().unwrap();
        write(dir.path(), "t/nmap/bad.yaml", "this is not valid yaml: [[[");

        let err = load_template(dir.path(), "t").unwrap_err();
        assert!(matches!(err, LoadError::Yaml { .. }));
    }

    #[test]
    fn test_bundled_default_template_loads() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("workflows");
        let template = load_template(&root, "default").unwrap();
        assert!(template.len() >= 3);
    }
}
