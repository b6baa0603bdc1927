//! 变异操作

use serde::{Deserialize, Serialize};

/// 单个变异操作；偏移为字节偏移，只对生成它时所依据的那一版产物有效
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOperation {
    /// 用新内容替换 [start, end)
    ReplaceSpan {
        start: usize,
        end: usize,
        content: String,
        justification: String,
    },
    /// 在 position 处插入内容
    InsertContent {
        position: usize,
        content: String,
        justification: String,
    },
    /// 替换 search 的全部出现
    FindReplace {
        search: String,
        replacement: String,
        justification: String,
    },
}

impl MutationOperation {
    pub fn replace_span(start: usize, end: usize, content: impl Into<String>, why: impl Into<String>) -> Self {
        Self::ReplaceSpan {
            start,
            end,
            content: content.into(),
            justification: why.into(),
        }
    }

    pub fn insert(position: usize, content: impl Into<String>, why: impl Into<String>) -> Self {
        Self::InsertContent {
            position,
            content: content.into(),
            justification: why.into(),
        }
    }

    pub fn find_replace(search: impl Into<String>, replacement: impl Into<String>, why: impl Into<String>) -> Self {
        Self::FindReplace {
            search: search.into(),
            replacement: replacement.into(),
            justification: why.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MutationOperation::ReplaceSpan { .. } => "replace_span",
            MutationOperation::InsertContent { .. } => "insert_content",
            MutationOperation::FindReplace { .. } => "find_replace",
        }
    }

    pub fn justification(&self) -> &str {
        match self {
            MutationOperation::ReplaceSpan { justification, .. }
            | MutationOperation::InsertContent { justification, .. }
            | MutationOperation::FindReplace { justification, .. } => justification,
        }
    }

    /// 新引入的文本（用于模式登记册的关键字比较）
    pub fn new_text(&self) -> &str {
        match self {
            MutationOperation::ReplaceSpan { content, .. }
            | MutationOperation::InsertContent { content, .. } => content,
            MutationOperation::FindReplace { replacement, .. } => replacement,
        }
    }

    /// 一行摘要，写入改进记录与登记册
    pub fn summary(&self) -> String {
        match self {
            MutationOperation::ReplaceSpan { start, end, content, .. } => {
                format!("replace [{}..{}) with \"{}\"", start, end, content.trim())
            }
            MutationOperation::InsertContent { position, content, .. } => {
                format!("insert at {}: \"{}\"", position, content.trim())
            }
            MutationOperation::FindReplace { search, replacement, .. } => {
                format!("replace \"{}\" with \"{}\"", search, replacement)
            }
        }
    }
}

/// 一组针对某个版本的变异
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationPlan {
    pub base_version: u32,
    pub operations: Vec<MutationOperation>,
}

impl MutationPlan {
    pub fn new(base_version: u32) -> Self {
        Self {
            base_version,
            operations: Vec::new(),
        }
    }

    pub fn push(&mut self, op: MutationOperation) {
        self.operations.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
