//! Index-addressed document model used by the live section updater.
//!
//! Offsets count characters from 1. Every body element covers its text plus
//! its trailing newline, and the final newline of the body can never be
//! deleted.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::types::{ContentNode, NodeKind};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralElement {
    pub start_index: usize,
    pub end_index: usize,
    pub kind: NodeKind,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredDocument {
    pub document_id: String,
    pub body: Vec<StructuralElement>,
}

impl StructuredDocument {
    /// Exclusive end offset of the body.
    pub fn body_end(&self) -> usize {
        self.body
            .last()
            .map(|element| element.end_index)
            .unwrap_or(1)
    }

    /// Element that contains `offset`, or else the one starting closest to
    /// it within `tolerance` characters.
    pub fn element_near(&self, offset: usize, tolerance: usize) -> Option<&StructuralElement> {
        if let Some(containing) = self
            .body
            .iter()
            .find(|element| element.start_index <= offset && offset < element.end_index)
        {
            return Some(containing);
        }

        self.body
            .iter()
            .map(|element| (element.start_index.abs_diff(offset), element))
            .filter(|(distance, _)| *distance <= tolerance)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, element)| element)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EditOp {
    DeleteContentRange { start_index: usize, end_index: usize },
    InsertText { index: usize, text: String },
}

/// Remote structured-document API. A batch is applied atomically, in order.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    async fn get(&self, document_id: &str) -> EngineResult<StructuredDocument>;

    async fn batch_edit(&self, document_id: &str, ops: &[EditOp]) -> EngineResult<()>;
}

/// Parser input for a fetched document, offsets included.
pub fn structural_nodes(document: &StructuredDocument) -> Vec<ContentNode> {
    document
        .body
        .iter()
        .map(|element| ContentNode {
            kind: element.kind,
            text: element.text.trim_end_matches('\n').to_string(),
            start_index: Some(element.start_index),
            end_index: Some(element.end_index),
        })
        .collect()
}

/// Documents kept as flat text, one paragraph per line.
#[derive(Default)]
pub struct InMemoryDocuments {
    documents: RwLock<HashMap<String, Vec<char>>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document_id: impl Into<String>, text: &str) {
        let mut characters = text.chars().collect::<Vec<char>>();
        if characters.last() != Some(&'\n') {
            characters.push('\n');
        }
        self.documents
            .write()
            .await
            .insert(document_id.into(), characters);
    }

    pub async fn text(&self, document_id: &str) -> Option<String> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|characters| characters.iter().collect())
    }
}

fn elements_of(characters: &[char]) -> Vec<StructuralElement> {
    let mut elements = Vec::new();
    let mut start = 0;
    for (index, character) in characters.iter().enumerate() {
        if *character == '\n' {
            elements.push(StructuralElement {
                start_index: start + 1,
                end_index: index + 2,
                kind: NodeKind::Paragraph,
                text: characters[start..=index].iter().collect(),
            });
            start = index + 1;
        }
    }
    elements
}

fn apply_edit(characters: &mut Vec<char>, op: &EditOp) -> EngineResult<()> {
    let length = characters.len();
    match op {
        EditOp::DeleteContentRange {
            start_index,
            end_index,
        } => {
            if *start_index < 1 || start_index >= end_index {
                return Err(EngineError::Remote(format!(
                    "invalid delete range [{start_index}, {end_index})"
                )));
            }
            if *end_index > length {
                return Err(EngineError::Remote(format!(
                    "delete range [{start_index}, {end_index}) would remove the final newline"
                )));
            }
            characters.drain(start_index - 1..end_index - 1);
        }
        EditOp::InsertText { index, text } => {
            if text.is_empty() {
                return Err(EngineError::Remote("insert text is empty".to_string()));
            }
            if *index < 1 || *index > length {
                return Err(EngineError::Remote(format!(
                    "insert index {index} is outside the body (1..={length})"
                )));
            }
            let position = index - 1;
            characters.splice(position..position, text.chars());
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentApi for InMemoryDocuments {
    async fn get(&self, document_id: &str) -> EngineResult<StructuredDocument> {
        let documents = self.documents.read().await;
        let characters = documents
            .get(document_id)
            .ok_or_else(|| EngineError::Remote(format!("document '{document_id}' not found")))?;

        Ok(StructuredDocument {
            document_id: document_id.to_string(),
            body: elements_of(characters),
        })
    }

    async fn batch_edit(&self, document_id: &str, ops: &[EditOp]) -> EngineResult<()> {
        let mut documents = self.documents.write().await;
        let characters = documents
            .get_mut(document_id)
            .ok_or_else(|| EngineError::Remote(format!("document '{document_id}' not found")))?;

        let mut edited = characters.clone();
        for op in ops {
            apply_edit(&mut edited, op)?;
        }
        *characters = edited;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{structural_nodes, DocumentApi, EditOp, InMemoryDocuments};
    use crate::error::EngineError;

    #[tokio::test]
    async fn elements_cover_each_line_with_its_newline() {
        let documents = InMemoryDocuments::new();
        documents.insert("doc", "1. Intro\nhola").await;

        let document = documents.get("doc").await.expect("expected document");
        assert_eq!(document.body.len(), 2);
        assert_eq!(document.body[0].start_index, 1);
        assert_eq!(document.body[0].end_index, 10);
        assert_eq!(document.body[1].text, "hola\n");
        assert_eq!(document.body_end(), 15);

        let nodes = structural_nodes(&document);
        assert_eq!(nodes[0].text, "1. Intro");
        assert_eq!(nodes[1].start_index, Some(10));
    }

    #[tokio::test]
    async fn element_near_prefers_containing_then_closest() {
        let documents = InMemoryDocuments::new();
        documents.insert("doc", "abc\ndefg\n").await;
        let document = documents.get("doc").await.expect("expected document");

        assert_eq!(document.element_near(6, 0).map(|e| e.start_index), Some(5));
        assert_eq!(document.element_near(11, 6).map(|e| e.start_index), Some(5));
        assert!(document.element_near(40, 3).is_none());
    }

    #[tokio::test]
    async fn batch_applies_in_order_and_is_atomic() {
        let documents = InMemoryDocuments::new();
        documents.insert("doc", "titulo\nviejo\n").await;

        documents
            .batch_edit(
                "doc",
                &[
                    EditOp::DeleteContentRange {
                        start_index: 8,
                        end_index: 13,
                    },
                    EditOp::InsertText {
                        index: 8,
                        text: "nuevo".to_string(),
                    },
                ],
            )
            .await
            .expect("expected edit");
        assert_eq!(documents.text("doc").await.as_deref(), Some("titulo\nnuevo\n"));

        let result = documents
            .batch_edit(
                "doc",
                &[
                    EditOp::InsertText {
                        index: 1,
                        text: "x".to_string(),
                    },
                    EditOp::DeleteContentRange {
                        start_index: 1,
                        end_index: 15,
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(EngineError::Remote(_))));
        assert_eq!(documents.text("doc").await.as_deref(), Some("titulo\nnuevo\n"));
    }

    #[test]
    fn edit_ops_serialize_with_a_type_tag() {
        let op = EditOp::DeleteContentRange {
            start_index: 3,
            end_index: 9,
        };
        let value = serde_json::to_value(&op).expect("expected json");
        assert_eq!(value["type"], "deleteContentRange");
        assert_eq!(value["startIndex"], 3);
    }
}
