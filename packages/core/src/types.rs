use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionKind {
    Static,
    Dynamic,
}

/// One titled block of a proposal document.
///
/// `is_static` and `is_dynamic` are kept as a pair because that is the shape
/// hosts persist and exchange; they are only ever written through
/// [`Section::set_kind`], which keeps them mutually exclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub order: i64,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_dynamic: bool,
    /// Offset of the title element in the live document this section was
    /// parsed from. Stale after any edit to that document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<usize>,
    /// Classification marker found in the source text, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<SectionKind>,
}

impl Section {
    pub fn new(order: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            order,
            title: title.into(),
            content: content.into(),
            is_static: false,
            is_dynamic: true,
            start_index: None,
            marker: None,
        }
    }

    pub fn kind(&self) -> SectionKind {
        if self.is_static && !self.is_dynamic {
            SectionKind::Static
        } else {
            SectionKind::Dynamic
        }
    }

    pub fn set_kind(&mut self, kind: SectionKind) {
        self.is_static = kind == SectionKind::Static;
        self.is_dynamic = kind == SectionKind::Dynamic;
    }
}

/// Persisted per-template classification, matched to parsed sections by
/// `order`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSection {
    pub order: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_dynamic: bool,
}

impl TemplateSection {
    /// `is_dynamic` wins when both flags are set; neither flag means dynamic.
    pub fn kind(&self) -> SectionKind {
        if !self.is_dynamic && self.is_static {
            SectionKind::Static
        } else {
            SectionKind::Dynamic
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionSource {
    Static,
    Dynamic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedSection {
    #[serde(flatten)]
    pub section: Section,
    pub source: SectionSource,
}

/// Same `order` on both sides with titles that do not match after
/// normalization. The dynamic side still wins.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConflict {
    pub order: i64,
    pub static_title: String,
    pub dynamic_title: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Paragraph,
    Table,
}

/// A linearized unit of document content fed to the section parser.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentNode {
    pub kind: NodeKind,
    pub text: String,
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
}

impl ContentNode {
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Paragraph,
            text: text.into(),
            start_index: None,
            end_index: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedDocument {
    pub text: String,
    pub html: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RelationshipDef {
    pub rel_type: String,
    pub target: String,
    pub target_mode: Option<String>,
}

impl RelationshipDef {
    pub(crate) fn is_external(&self) -> bool {
        self.target_mode
            .as_deref()
            .map(|mode| mode.eq_ignore_ascii_case("External"))
            .unwrap_or(false)
    }
}

pub(crate) struct SourceStyleDefinition {
    pub xml: String,
    pub dependencies: Vec<String>,
}
