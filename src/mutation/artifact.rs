//! 指令产物的版本链
//!
//! 每一步进化由 v 生成 v+1；已有版本不可变，保留用于审计与回滚。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 某一版指令产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionArtifact {
    pub version: u32,
    pub text: String,
    /// 由哪一版派生；v0 为 None
    pub parent: Option<u32>,
    /// 产生这一版的改进 id
    pub change_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// 版本链：v0 的受保护元素是所有后代必须保留的基线
#[derive(Debug, Clone)]
pub struct ArtifactLineage {
    versions: Vec<InstructionArtifact>,
    /// v0 中的受保护元素文本
    baseline_protected: Vec<String>,
}

impl ArtifactLineage {
    pub fn new(text: impl Into<String>, baseline_protected: Vec<String>) -> Self {
        Self {
            versions: vec![InstructionArtifact {
                version: 0,
                text: text.into(),
                parent: None,
                change_ids: Vec::new(),
                created_at: Utc::now(),
            }],
            baseline_protected,
        }
    }

    /// 从已持久化的版本恢复（按版本号排序，至少含一个版本）
    pub fn restore(mut versions: Vec<InstructionArtifact>, baseline_protected: Vec<String>) -> Option<Self> {
        if versions.is_empty() {
            return None;
        }
        versions.sort_by_key(|v| v.version);
        Some(Self {
            versions,
            baseline_protected,
        })
    }

    pub fn current(&self) -> &InstructionArtifact {
        // versions 构造时至少含 v0
        &self.versions[self.versions.len() - 1]
    }

    pub fn baseline(&self) -> &InstructionArtifact {
        &self.versions[0]
    }

    pub fn baseline_protected(&self) -> &[String] {
        &self.baseline_protected
    }

    pub fn get(&self, version: u32) -> Option<&InstructionArtifact> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn versions(&self) -> &[InstructionArtifact] {
        &self.versions
    }

    /// 追加新版本，返回其版本号
    pub fn push(&mut self, text: String, change_ids: Vec<String>) -> u32 {
        let parent = self.current().version;
        let version = parent + 1;
        self.versions.push(InstructionArtifact {
            version,
            text,
            parent: Some(parent),
            change_ids,
            created_at: Utc::now(),
        });
        version
    }

    /// 回滚：以旧版本的文本创建一个新版本（不删除历史）
    pub fn rollback_to(&mut self, version: u32) -> Option<u32> {
        let text = self.get(version)?.text.clone();
        Some(self.push(text, vec![format!("rollback_to_v{}", version)]))
    }

    /// text 中缺失的 v0 受保护元素（按出现次数比较）
    pub fn missing_from_baseline(&self, text: &str) -> Vec<String> {
        let mut missing = Vec::new();
        let mut checked: Vec<&String> = Vec::new();
        for element in &self.baseline_protected {
            if checked.contains(&element) {
                continue;
            }
            checked.push(element);
            let required = self.baseline_protected.iter().filter(|e| *e == element).count();
            if text.matches(element.as_str()).count() < required {
                missing.push(element.clone());
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_links_parent_and_keeps_history() {
        let mut lineage = ArtifactLineage::new("v0 {theme}", vec!["{theme}".into()]);
        let v1 = lineage.push("v1 {theme}".into(), vec!["001_prompt_evolution_a".into()]);
        assert_eq!(v1, 1);
        assert_eq!(lineage.current().parent, Some(0));
        assert_eq!(lineage.get(0).unwrap().text, "v0 {theme}");
        assert_eq!(lineage.versions().len(), 2);
    }

    #[test]
    fn test_rollback_creates_new_version() {
        let mut lineage = ArtifactLineage::new("base", vec![]);
        lineage.push("changed".into(), vec![]);
        let v = lineage.rollback_to(0).unwrap();
        assert_eq!(v, 2);
        assert_eq!(lineage.current().text, "base");
        assert!(lineage.rollback_to(9).is_none());
    }

    #[test]
    fn test_missing_from_baseline_counts_occurrences() {
        let lineage = ArtifactLineage::new("{a} {a} {b}", vec!["{a}".into(), "{a}".into(), "{b}".into()]);
        assert!(lineage.missing_from_baseline("{a} {a} {b}").is_empty());
        assert_eq!(lineage.missing_from_baseline("{a} {b}"), vec!["{a}".to_string()]);
        assert_eq!(lineage.missing_from_baseline("{a} {a}"), vec!["{b}".to_string()]);
    }
}
