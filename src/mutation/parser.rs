//! 指令产物解析：受保护元素与可编辑区
//!
//! 受保护元素 = 模板占位符（`{x}`、`{{x}}`、`%(x)s`）、XML 风格标签与结构标记（`## Requirements:` 等）。
//! 可编辑区是受保护元素之间的补集；只含空白的区间不算可编辑区。

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 结构标记；最后四个之外均按原样大小写匹配
pub const STRUCTURE_MARKERS: &[&str] = &[
    "## Requirements:",
    "## Output Format:",
    "## Quality Standards:",
    "## Constraints:",
    "## Analysis Requirements:",
    "## Implementation Requirements:",
    "## Enhancement Requirements:",
    "## Planning Requirements:",
    "You MUST respond with ONLY a valid JSON object",
    "Return EXACTLY this JSON structure:",
    "Return a JSON object with",
    "Focus on",
    "CRITICAL INSTRUCTION:",
    "CRITICAL: JSON OUTPUT REQUIRED",
];

/// 大小写不敏感的提示标记
pub const CASE_INSENSITIVE_MARKERS: &[&str] = &["IMPORTANT:", "NOTE:", "WARNING:", "CRITICAL:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedKind {
    /// `{name}`
    Placeholder,
    /// `{{name}}`
    DoubleBracePlaceholder,
    /// `%(name)s`
    PercentPlaceholder,
    /// `<tag>`
    XmlTag,
    StructuralMarker,
}

impl ProtectedKind {
    /// 是否为模板占位符（校验关键子集时只看这些）
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            ProtectedKind::Placeholder
                | ProtectedKind::DoubleBracePlaceholder
                | ProtectedKind::PercentPlaceholder
        )
    }
}

/// 受保护元素：字节区间 [start, end)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedElement {
    pub kind: ProtectedKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl ProtectedElement {
    /// 与 [start, end) 是否相交；end == start 表示插入点，只有严格落在元素内部才算相交
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        if start == end {
            return self.start < start && start < self.end;
        }
        !(end <= self.start || start >= self.end)
    }
}

/// 可编辑区：字节区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditableZone {
    pub start: usize,
    pub end: usize,
}

impl EditableZone {
    pub fn contains(&self, start: usize, end: usize) -> bool {
        start >= self.start && end <= self.end
    }
}

/// 解析结果，只对这一版文本有效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArtifact {
    pub text: String,
    /// 按起点排序；彼此可能重叠（如 `{{x}}` 同时命中双括号与单括号模式）
    pub protected: Vec<ProtectedElement>,
    pub zones: Vec<EditableZone>,
}

impl ParsedArtifact {
    pub fn zone_text(&self, zone: &EditableZone) -> &str {
        &self.text[zone.start..zone.end]
    }

    /// 完整包含 [start, end) 的可编辑区
    pub fn zone_containing(&self, start: usize, end: usize) -> Option<&EditableZone> {
        self.zones.iter().find(|z| z.contains(start, end))
    }

    /// [start, end) 是否与任一受保护元素相交
    pub fn intersects_protected(&self, start: usize, end: usize) -> Option<&ProtectedElement> {
        self.protected.iter().find(|p| p.intersects(start, end))
    }

    /// 出现过的占位符文本（去重、保持首次出现顺序）
    pub fn placeholders(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in self.protected.iter().filter(|p| p.kind.is_placeholder()) {
            if !out.contains(&p.text) {
                out.push(p.text.clone());
            }
        }
        out
    }

    /// 所有受保护元素的文本（含重复），用于结构完整性比较
    pub fn protected_texts(&self) -> Vec<String> {
        self.protected.iter().map(|p| p.text.clone()).collect()
    }

    pub fn editable_len(&self) -> usize {
        self.zones.iter().map(|z| z.end - z.start).sum()
    }
}

/// 预编译的受保护元素扫描器
#[derive(Debug, Clone)]
pub struct ArtifactParser {
    patterns: Vec<(ProtectedKind, Regex)>,
}

impl ArtifactParser {
    pub fn new() -> Result<Self, regex::Error> {
        let literal = STRUCTURE_MARKERS
            .iter()
            .map(|m| regex::escape(m))
            .collect::<Vec<_>>()
            .join("|");
        let insensitive = CASE_INSENSITIVE_MARKERS
            .iter()
            .map(|m| regex::escape(m))
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            patterns: vec![
                (ProtectedKind::DoubleBracePlaceholder, Regex::new(r"\{\{[^}]+\}\}")?),
                (ProtectedKind::Placeholder, Regex::new(r"\{[^{}]+\}")?),
                (ProtectedKind::PercentPlaceholder, Regex::new(r"%\([^)]+\)s")?),
                (ProtectedKind::XmlTag, Regex::new(r"<[^<>]+>")?),
                (ProtectedKind::StructuralMarker, Regex::new(&literal)?),
                (
                    ProtectedKind::StructuralMarker,
                    Regex::new(&format!("(?i:{})", insensitive))?,
                ),
            ],
        })
    }

    pub fn parse(&self, text: &str) -> ParsedArtifact {
        let mut protected: Vec<ProtectedElement> = Vec::new();
        for (kind, re) in &self.patterns {
            for m in re.find_iter(text) {
                // 同一区间只记一次（`{{x}}` 内部的 `{x}` 由双括号元素覆盖）
                let covered = protected
                    .iter()
                    .any(|p| p.start <= m.start() && m.end() <= p.end);
                if !covered {
                    protected.push(ProtectedElement {
                        kind: *kind,
                        text: m.as_str().to_string(),
                        start: m.start(),
                        end: m.end(),
                    });
                }
            }
        }
        protected.sort_by_key(|p| (p.start, std::cmp::Reverse(p.end)));

        let zones = editable_zones(text, &protected);
        ParsedArtifact {
            text: text.to_string(),
            protected,
            zones,
        }
    }
}

/// 受保护区间合并后的补集，跳过只含空白的区间
fn editable_zones(text: &str, protected: &[ProtectedElement]) -> Vec<EditableZone> {
    let mut zones = Vec::new();
    let mut cursor = 0usize;
    for p in protected {
        if p.start > cursor {
            push_zone(text, cursor, p.start, &mut zones);
        }
        cursor = cursor.max(p.end);
    }
    if cursor < text.len() {
        push_zone(text, cursor, text.len(), &mut zones);
    }
    zones
}

fn push_zone(text: &str, start: usize, end: usize, zones: &mut Vec<EditableZone>) {
    if !text[start..end].trim().is_empty() {
        zones.push(EditableZone { start, end });
    }
}
