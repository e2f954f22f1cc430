//! Filesystem [`WorkflowSource`].

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use stepwise_core::workflow::collaborator::WorkflowSource;
use stepwise_core::workflow::definition::{DefinitionError, parse_workflow_yaml};
use stepwise_types::workflow::WorkflowDefinition;

/// Resolves subworkflow references as YAML files relative to a base
/// directory (normally the directory of the parent document).
#[derive(Debug, Clone)]
pub struct FsWorkflowSource {
    base_dir: PathBuf,
}

impl FsWorkflowSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Source rooted at the directory containing `document`.
    pub fn beside(document: &Path) -> Self {
        let dir = document
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Self::new(dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

impl WorkflowSource for FsWorkflowSource {
    fn load<'a>(
        &'a self,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<WorkflowDefinition, DefinitionError>> {
        Box::pin(async move {
            let path = self.resolve(reference);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(DefinitionError::NotFound(reference.to_string()));
                }
                Err(source) => return Err(DefinitionError::Io { path, source }),
            };
            let def = parse_workflow_yaml(&content)?;
            tracing::debug!(
                reference,
                path = %path.display(),
                workflow = %def.name,
                "loaded subworkflow"
            );
            Ok(def)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CHILD: &str =
        "name: child\nversion: \"0.1.0\"\nsteps:\n  - name: mark\n    type: checkpoint\n";

    #[tokio::test]
    async fn loads_relative_to_base_dir() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::create_dir(tmp.path().join("flows")).await.unwrap();
        tokio::fs::write(tmp.path().join("flows/child.yaml"), CHILD)
            .await
            .unwrap();

        let source = FsWorkflowSource::new(tmp.path());
        let def = source.load("flows/child.yaml").await.unwrap();
        assert_eq!(def.name, "child");
    }

    #[tokio::test]
    async fn beside_uses_parent_directory_of_document() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("child.yaml"), CHILD).await.unwrap();

        let source = FsWorkflowSource::beside(&tmp.path().join("parent.yaml"));
        assert_eq!(source.base_dir(), tmp.path());
        assert!(source.load("child.yaml").await.is_ok());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let source = FsWorkflowSource::new(tmp.path());
        let err = source.load("nope.yaml").await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound(r) if r == "nope.yaml"));
    }

    #[tokio::test]
    async fn invalid_document_is_rejected() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("bad.yaml"), "name: bad\nversion: \"0.1.0\"\nsteps: []\n")
            .await
            .unwrap();

        let source = FsWorkflowSource::new(tmp.path());
        assert!(source.load("bad.yaml").await.is_err());
    }
}
