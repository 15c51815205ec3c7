use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::fs;

use mctl_types::Task;

/// Markdown deliverables and error reports under `<state_dir>/artifacts`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("artifacts"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn deliverable_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.md", file_safe(task_id)))
    }

    pub fn error_report_path(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.error.md", file_safe(task_id), file_safe(run_id)))
    }

    pub async fn write_deliverable(
        &self,
        task: &Task,
        body: &str,
        approved_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        let mut doc = format!("# {}\n\n", task.title.trim());
        doc.push_str(&format!("- task: `{}`\n", task.id));
        doc.push_str(&format!("- owner: `{}`\n", task.owner_role_id));
        if let Some(approver) = approved_by {
            doc.push_str(&format!("- approved_by: {approver}\n"));
        }
        doc.push_str(&format!("- archived_at: {}\n\n", now.to_rfc3339()));
        doc.push_str(body.trim());
        doc.push('\n');
        let path = self.deliverable_path(&task.id);
        self.write(&path, &doc).await?;
        Ok(path)
    }

    pub async fn write_error_report(
        &self,
        task_id: &str,
        run_id: &str,
        report: &str,
    ) -> anyhow::Result<PathBuf> {
        let path = self.error_report_path(task_id, run_id);
        self.write(&path, report).await?;
        Ok(path)
    }

    /// Deletes the deliverable and every error report of a task. Returns the number removed.
    pub async fn remove_for_task(&self, task_id: &str) -> anyhow::Result<usize> {
        let prefix = format!("{}.", file_safe(task_id));
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".md") {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn write(&self, path: &Path, contents: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

pub fn render_error_report(
    task: &Task,
    run_id: &str,
    code: &str,
    message: &str,
    at: DateTime<Utc>,
) -> String {
    format!(
        "# Run failed: {}\n\n\
| field | value |\n|---|---|\n\
| task | `{}` |\n| run | `{}` |\n| role | `{}` |\n| error_code | `{}` |\n| failed_at | {} |\n\n\
## Error\n\n{}\n\n\
The loop does not retry on its own. Use retry or dispatch to start a new run.\n",
        task.title.trim(),
        task.id,
        run_id,
        task.owner_role_id,
        code,
        at.to_rfc3339(),
        message.trim()
    )
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
