//! 工作流状态持久化
//!
//! 主文件 `workflow-state.json` + `backups/` 目录下带时间戳的轮转副本。
//! 写入先落临时文件再 rename；每次保存同时写一个备份并裁剪到保留数量（旧的先删）。
//! 恢复时先校验主文件，失败则从新到旧扫描备份，恢复第一个通过校验的副本。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::fs;

use crate::core::WorkflowError;
use crate::workflow::catalog::PhaseCatalog;
use crate::workflow::types::WorkflowInstance;

const PRIMARY_FILE: &str = "workflow-state.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "workflow-state-";

/// 文档必须包含的顶层字段
const REQUIRED_FIELDS: [&str; 5] = ["schema_version", "current_phase", "variant", "history", "metadata"];

/// 基于目录的状态存储
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    retention: usize,
    /// 同一时刻多次保存时保证备份文件名唯一且有序
    sequence: AtomicU64,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>, retention: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retention: retention.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(PRIMARY_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(self.primary_path()).await.unwrap_or(false)
    }

    /// 保存主文件并写入备份
    pub async fn save(&self, instance: &WorkflowInstance) -> Result<(), WorkflowError> {
        fs::create_dir_all(self.backup_dir()).await?;
        let json = serde_json::to_string_pretty(instance)?;

        let primary = self.primary_path();
        let temp = primary.with_extension("json.tmp");
        fs::write(&temp, &json).await?;
        fs::rename(&temp, &primary).await?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let backup = self
            .backup_dir()
            .join(format!("{BACKUP_PREFIX}{stamp}-{seq:06}.json"));
        fs::write(&backup, &json).await?;

        self.rotate_backups().await?;
        tracing::debug!("Workflow state saved to {}", primary.display());
        Ok(())
    }

    /// 备份文件路径，按时间从旧到新
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>, WorkflowError> {
        let dir = self.backup_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir).await?;
        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(".json") {
                backups.push(entry.path());
            }
        }
        // 文件名定宽时间戳，字典序即时间序
        backups.sort();
        Ok(backups)
    }

    async fn rotate_backups(&self) -> Result<(), WorkflowError> {
        let backups = self.list_backups().await?;
        if backups.len() > self.retention {
            let excess = backups.len() - self.retention;
            for old in &backups[..excess] {
                fs::remove_file(old).await?;
                tracing::debug!("Discarded old backup {}", old.display());
            }
        }
        Ok(())
    }

    /// 加载并校验主文件；主文件不存在返回 None
    pub async fn load(&self, catalog: &PhaseCatalog) -> Result<Option<WorkflowInstance>, WorkflowError> {
        if !self.exists().await {
            return Ok(None);
        }
        let text = fs::read_to_string(self.primary_path()).await?;
        verify(&text, catalog)
            .map(Some)
            .map_err(WorkflowError::RecoveryFailed)
    }

    /// 崩溃恢复：主文件校验失败时回退到最新的有效备份，并用它重写主文件
    pub async fn recover(&self, catalog: &PhaseCatalog) -> Result<WorkflowInstance, WorkflowError> {
        let primary_error = match fs::read_to_string(self.primary_path()).await {
            Ok(text) => match verify(&text, catalog) {
                Ok(instance) => return Ok(instance),
                Err(e) => e,
            },
            Err(e) => format!("primary unreadable: {e}"),
        };
        tracing::warn!("Primary workflow state invalid ({}), scanning backups", primary_error);

        for backup in self.list_backups().await?.iter().rev() {
            let text = match fs::read_to_string(backup).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("Skipping unreadable backup {}: {}", backup.display(), e);
                    continue;
                }
            };
            match verify(&text, catalog) {
                Ok(instance) => {
                    let primary = self.primary_path();
                    let temp = primary.with_extension("json.tmp");
                    fs::write(&temp, &text).await?;
                    fs::rename(&temp, &primary).await?;
                    tracing::info!("Workflow state restored from backup {}", backup.display());
                    return Ok(instance);
                }
                Err(e) => {
                    tracing::warn!("Backup {} failed verification: {}", backup.display(), e);
                }
            }
        }

        Err(WorkflowError::RecoveryFailed(format!(
            "{primary_error}; no valid backup in {}",
            self.backup_dir().display()
        )))
    }

    /// 删除主文件与全部备份
    pub async fn remove(&self) -> Result<(), WorkflowError> {
        if self.exists().await {
            fs::remove_file(self.primary_path()).await?;
        }
        for backup in self.list_backups().await? {
            fs::remove_file(backup).await?;
        }
        Ok(())
    }
}

/// 完整性校验：必需字段齐全、可反序列化、阶段 id 均在目录中
pub fn verify(text: &str, catalog: &PhaseCatalog) -> Result<WorkflowInstance, String> {
    let raw: Value = serde_json::from_str(text).map_err(|e| format!("not valid JSON: {e}"))?;
    let object = raw
        .as_object()
        .ok_or_else(|| "document is not an object".to_string())?;
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| !object.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing fields: {}", missing.join(", ")));
    }

    let instance: WorkflowInstance =
        serde_json::from_value(raw).map_err(|e| format!("malformed document: {e}"))?;

    if !catalog.contains(&instance.current_phase) {
        return Err(format!("unknown current phase '{}'", instance.current_phase));
    }
    if let Some(unknown) = instance.metadata.keys().find(|id| !catalog.contains(id)) {
        return Err(format!("metadata for unknown phase '{unknown}'"));
    }
    Ok(instance)
}
