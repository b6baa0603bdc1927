//! 文本变异引擎：解析受保护元素与可编辑区，应用并校验变异，维护不可变的版本链

pub mod artifact;
pub mod engine;
pub mod operation;
pub mod parser;

pub use artifact::{ArtifactLineage, InstructionArtifact};
pub use engine::{
    EvolveOutcome, MutationEngine, Reconstruction, RejectedMutation, Strictness, ValidationReport,
};
pub use operation::{MutationOperation, MutationPlan};
pub use parser::{
    ArtifactParser, EditableZone, ParsedArtifact, ProtectedElement, ProtectedKind,
    CASE_INSENSITIVE_MARKERS, STRUCTURE_MARKERS,
};
