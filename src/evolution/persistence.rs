//! 运行目录的持久化
//!
//! 布局：
//! - `artifact_v{N}.txt`：每个指令版本的文本
//! - `iteration_{NNN}/artifacts/{case}.md`、`iteration_{NNN}/scores.json`
//! - `evolution_results.json`：整次运行的结构化结果
//! - `checkpoint.json`：最后完成的阶段，用于崩溃后恢复
//!
//! 每个阶段结束时写检查点；启动时读取检查点与版本文本恢复。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::{EvolutionError, EvolutionPhase, TerminalState};
use crate::evolution::engine::{CallStats, HealthState};
use crate::evolution::types::{EvaluationSnapshot, IterationRecord};
use crate::mutation::{ArtifactLineage, InstructionArtifact};
use crate::oracle::{GeneratedArtifact, ScoreCard};

pub const RESULTS_FILE: &str = "evolution_results.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// 版本元数据；文本单独存放在 artifact_v{N}.txt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub version: u32,
    pub parent: Option<u32>,
    pub change_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&InstructionArtifact> for ArtifactMeta {
    fn from(a: &InstructionArtifact) -> Self {
        Self {
            version: a.version,
            parent: a.parent,
            change_ids: a.change_ids.clone(),
            created_at: a.created_at,
        }
    }
}

/// 检查点：恢复运行所需的全部控制器状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// 最后一个（可能尚未关闭的）迭代
    pub iteration: u32,
    /// 该迭代最后完成的阶段
    pub phase: EvolutionPhase,
    pub artifacts: Vec<ArtifactMeta>,
    pub baseline_protected: Vec<String>,
    pub records: Vec<IterationRecord>,
    /// 已部署能力名 → 改进 id
    pub deployed: BTreeMap<String, String>,
    pub health: HealthState,
    /// 当前迭代的调用统计
    pub call_stats: CallStats,
    /// 已终止的运行不再继续；取消不算终止
    pub terminal: Option<TerminalState>,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

/// 单个用例的评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseScore {
    pub case_id: String,
    pub card: Option<ScoreCard>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScoresFile {
    snapshot: EvaluationSnapshot,
    cases: Vec<CaseScore>,
}

/// 运行目录
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, EvolutionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("artifact_v{}.txt", version))
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("iteration_{:03}", iteration))
    }

    /// 全新运行前清掉旧的检查点与版本文本
    pub async fn reset(&self) -> Result<(), EvolutionError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stale = name == CHECKPOINT_FILE || (name.starts_with("artifact_v") && name.ends_with(".txt"));
            if stale {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("Cleared {} files from a previous run in {}", removed, self.dir.display());
        }
        Ok(())
    }

    /// 写入尚未落盘的版本文本（已存在的版本不可变，不覆盖）
    pub async fn write_artifacts(&self, lineage: &ArtifactLineage) -> Result<(), EvolutionError> {
        for artifact in lineage.versions() {
            let path = self.artifact_path(artifact.version);
            if fs::metadata(&path).await.is_err() {
                fs::write(&path, &artifact.text).await?;
                tracing::debug!("Wrote {}", path.display());
            }
        }
        Ok(())
    }

    pub async fn write_generated(&self, iteration: u32, generated: &[GeneratedArtifact]) -> Result<(), EvolutionError> {
        let dir = self.iteration_dir(iteration).join("artifacts");
        fs::create_dir_all(&dir).await?;
        for artifact in generated {
            fs::write(dir.join(format!("{}.md", sanitize(&artifact.case_id))), &artifact.content).await?;
        }
        Ok(())
    }

    pub async fn write_scores(
        &self,
        iteration: u32,
        snapshot: &EvaluationSnapshot,
        cases: &[CaseScore],
    ) -> Result<(), EvolutionError> {
        let dir = self.iteration_dir(iteration);
        fs::create_dir_all(&dir).await?;
        let file = ScoresFile {
            snapshot: snapshot.clone(),
            cases: cases.to_vec(),
        };
        fs::write(dir.join("scores.json"), serde_json::to_string_pretty(&file)?).await?;
        Ok(())
    }

    pub async fn write_results<T: Serialize>(&self, results: &T) -> Result<(), EvolutionError> {
        fs::write(self.dir.join(RESULTS_FILE), serde_json::to_string_pretty(results)?).await?;
        Ok(())
    }

    /// 先写临时文件再改名，崩溃时不会留下半个检查点
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EvolutionError> {
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(checkpoint)?).await?;
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE)).await?;
        tracing::debug!(
            "Checkpoint saved: iteration {} after {}",
            checkpoint.iteration,
            checkpoint.phase
        );
        Ok(())
    }

    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, EvolutionError> {
        let path = self.dir.join(CHECKPOINT_FILE);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 用检查点里的元数据和 artifact_v{N}.txt 重建版本链
    pub async fn restore_lineage(&self, checkpoint: &Checkpoint) -> Result<ArtifactLineage, EvolutionError> {
        let mut versions = Vec::with_capacity(checkpoint.artifacts.len());
        for meta in &checkpoint.artifacts {
            let path = self.artifact_path(meta.version);
            let text = fs::read_to_string(&path).await.map_err(|e| {
                EvolutionError::NotFound(format!("{} ({})", path.display(), e))
            })?;
            versions.push(InstructionArtifact {
                version: meta.version,
                text,
                parent: meta.parent,
                change_ids: meta.change_ids.clone(),
                created_at: meta.created_at,
            });
        }
        ArtifactLineage::restore(versions, checkpoint.baseline_protected.clone())
            .ok_or_else(|| EvolutionError::NotFound("checkpoint lists no artifact versions".into()))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
