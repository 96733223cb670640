//! Replaces dynamic section bodies in a live, index-addressed document.
//!
//! Every edit shifts the offsets of everything after it, so each section is
//! written in its own batch and the document is fetched and re-parsed before
//! the next one is located.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::classify::resolve_classification;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::live_doc::{structural_nodes, DocumentApi, EditOp, StructuredDocument};
use crate::section_parse::SectionParser;
use crate::types::{Section, TemplateSection};
use crate::util::normalize_title;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionUpdate {
    pub order: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedUpdate {
    pub order: i64,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub applied: Vec<i64>,
    pub skipped: Vec<SkippedUpdate>,
}

/// Document as fetched, with its freshly parsed sections.
struct Snapshot {
    document: StructuredDocument,
    sections: Vec<Section>,
}

struct PlannedEdit {
    order: i64,
    ops: Vec<EditOp>,
    /// Offset just past the rewritten body, in the document after the edit.
    written_end: usize,
}

enum UpdateState {
    Fetch,
    Locate(Snapshot),
    Edit(PlannedEdit),
    Done,
}

pub struct SectionUpdater<'a, A: DocumentApi + ?Sized> {
    api: &'a A,
    config: &'a EngineConfig,
    declarations: Option<&'a [TemplateSection]>,
}

impl<'a, A: DocumentApi + ?Sized> SectionUpdater<'a, A> {
    pub fn new(api: &'a A, config: &'a EngineConfig) -> Self {
        Self {
            api,
            config,
            declarations: None,
        }
    }

    pub fn with_declarations(mut self, declarations: Option<&'a [TemplateSection]>) -> Self {
        self.declarations = declarations;
        self
    }

    /// Applies `updates` in ascending order. Sections that cannot be found,
    /// or that are static, are skipped and reported. A failed fetch or edit
    /// aborts the run; re-running the whole pass is the recovery.
    ///
    /// Text written for one section may itself look like section titles, so
    /// later updates only look at sections starting after the last rewritten
    /// body.
    pub async fn update_sections(
        &self,
        document_id: &str,
        mut updates: Vec<SectionUpdate>,
    ) -> EngineResult<UpdateReport> {
        updates.sort_by_key(|update| update.order);
        let mut pending = VecDeque::from(updates);
        let mut report = UpdateReport::default();
        let mut floor = 0;
        let mut state = UpdateState::Fetch;

        loop {
            state = match state {
                UpdateState::Fetch => {
                    if pending.is_empty() {
                        UpdateState::Done
                    } else {
                        UpdateState::Locate(self.fetch(document_id).await?)
                    }
                }
                UpdateState::Locate(snapshot) => match pending.pop_front() {
                    None => UpdateState::Done,
                    Some(update) => match self.plan(&snapshot, &update, floor) {
                        Ok(planned) => UpdateState::Edit(planned),
                        Err(reason) => {
                            tracing::warn!(
                                document_id,
                                order = update.order,
                                reason = %reason,
                                "skipping section update"
                            );
                            report.skipped.push(SkippedUpdate {
                                order: update.order,
                                reason,
                            });
                            // Nothing was written, the snapshot is still current.
                            UpdateState::Locate(snapshot)
                        }
                    },
                },
                UpdateState::Edit(planned) => {
                    if !planned.ops.is_empty() {
                        self.api.batch_edit(document_id, &planned.ops).await?;
                    }
                    tracing::debug!(
                        document_id,
                        order = planned.order,
                        operations = planned.ops.len(),
                        "section rewritten"
                    );
                    report.applied.push(planned.order);
                    floor = planned.written_end;
                    UpdateState::Fetch
                }
                UpdateState::Done => break,
            };
        }

        tracing::info!(
            document_id,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "live document update finished"
        );
        Ok(report)
    }

    async fn fetch(&self, document_id: &str) -> EngineResult<Snapshot> {
        let document = self.api.get(document_id).await?;
        let parsed = SectionParser::new(self.config).parse_nodes(&structural_nodes(&document));
        let sections = resolve_classification(parsed, self.declarations)
            .into_iter()
            .filter(|section| section.start_index.is_some())
            .collect();
        Ok(Snapshot { document, sections })
    }

    /// Order match first, with the title breaking ties between sections
    /// sharing an order, then title match alone. Sections starting before
    /// `floor` are never candidates.
    fn find_target(snapshot: &Snapshot, update: &SectionUpdate, floor: usize) -> Option<usize> {
        let wanted = normalize_title(&update.title);
        let candidates = snapshot
            .sections
            .iter()
            .enumerate()
            .filter(|(_, section)| section.start_index.is_some_and(|start| start >= floor))
            .collect::<Vec<(usize, &Section)>>();

        let same_order = candidates
            .iter()
            .filter(|(_, section)| section.order == update.order)
            .collect::<Vec<_>>();
        if let Some((index, _)) = same_order
            .iter()
            .find(|(_, section)| !wanted.is_empty() && normalize_title(&section.title) == wanted)
            .or_else(|| same_order.first())
        {
            return Some(*index);
        }

        if wanted.is_empty() {
            return None;
        }
        candidates
            .iter()
            .find(|(_, section)| normalize_title(&section.title) == wanted)
            .map(|(index, _)| *index)
    }

    fn plan(
        &self,
        snapshot: &Snapshot,
        update: &SectionUpdate,
        floor: usize,
    ) -> Result<PlannedEdit, String> {
        let tolerance = self.config.offset_tolerance;
        let document = &snapshot.document;

        let target_index = Self::find_target(snapshot, update, floor)
            .ok_or_else(|| "section not found in document".to_string())?;
        let target = &snapshot.sections[target_index];
        if target.is_static {
            return Err("section is static".to_string());
        }

        let title_start = target.start_index.unwrap_or_default();
        let title_element = document
            .element_near(title_start, tolerance)
            .ok_or_else(|| format!("no element near offset {title_start}"))?;
        let insertion = title_element.end_index;

        let next_boundary = snapshot
            .sections
            .iter()
            .filter_map(|section| section.start_index)
            .filter(|start| *start >= insertion)
            .min()
            .map(|start| {
                document
                    .element_near(start, tolerance)
                    .map(|element| element.start_index)
                    .unwrap_or(start)
            });

        let content = update.content.trim();
        let body_end = document.body_end();
        let mut ops = Vec::new();

        match next_boundary {
            Some(boundary) => {
                if boundary > insertion {
                    ops.push(EditOp::DeleteContentRange {
                        start_index: insertion,
                        end_index: boundary,
                    });
                }
                if !content.is_empty() {
                    ops.push(EditOp::InsertText {
                        index: insertion,
                        text: format!("{content}\n"),
                    });
                }
            }
            // Title is the last paragraph: its newline is the undeletable one.
            None if insertion >= body_end => {
                if !content.is_empty() {
                    ops.push(EditOp::InsertText {
                        index: body_end - 1,
                        text: format!("\n{content}"),
                    });
                }
            }
            None => {
                let last_deletable = body_end - 1;
                if last_deletable > insertion {
                    ops.push(EditOp::DeleteContentRange {
                        start_index: insertion,
                        end_index: last_deletable,
                    });
                }
                if !content.is_empty() {
                    ops.push(EditOp::InsertText {
                        index: insertion,
                        text: content.to_string(),
                    });
                }
            }
        }

        let written_end = ops
            .iter()
            .find_map(|op| match op {
                EditOp::InsertText { index, text } => Some(index + text.chars().count()),
                EditOp::DeleteContentRange { .. } => None,
            })
            .unwrap_or(insertion);

        Ok(PlannedEdit {
            order: update.order,
            ops,
            written_end,
        })
    }
}

/// Per-document async locks. Two updates of one document must never
/// interleave because each trusts the offsets it just fetched.
#[derive(Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub async fn update_sections_serialized<A: DocumentApi + ?Sized>(
    locks: &DocumentLocks,
    api: &A,
    config: &EngineConfig,
    declarations: Option<&[TemplateSection]>,
    document_id: &str,
    updates: Vec<SectionUpdate>,
) -> EngineResult<UpdateReport> {
    let lock = locks.lock_for(document_id).await;
    let _guard = lock.lock().await;

    SectionUpdater::new(api, config)
        .with_declarations(declarations)
        .update_sections(document_id, updates)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{update_sections_serialized, DocumentLocks, SectionUpdate, SectionUpdater};
    use crate::config::EngineConfig;
    use crate::error::{EngineError, EngineResult};
    use crate::live_doc::{DocumentApi, EditOp, InMemoryDocuments, StructuredDocument};
    use crate::types::TemplateSection;

    const PROPOSAL: &str = "1. Intro\nhello\n2. Plan [DINÁMICO]\nold\n3. Costs\nfixed\n";

    fn update(order: i64, content: &str) -> SectionUpdate {
        SectionUpdate {
            order,
            title: String::new(),
            content: content.to_string(),
        }
    }

    async fn documents_with(text: &str) -> InMemoryDocuments {
        let documents = InMemoryDocuments::new();
        documents.insert("doc", text).await;
        documents
    }

    #[tokio::test]
    async fn middle_section_update_leaves_neighbours_untouched() {
        let documents = documents_with(PROPOSAL).await;
        let config = EngineConfig::default();

        let report = SectionUpdater::new(&documents, &config)
            .update_sections("doc", vec![update(2, "  new  ")])
            .await
            .expect("expected update");

        assert_eq!(report.applied, vec![2]);
        assert!(report.skipped.is_empty());
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\nhello\n2. Plan [DINÁMICO]\nnew\n3. Costs\nfixed\n")
        );
    }

    #[tokio::test]
    async fn refetches_between_sections_so_later_offsets_stay_valid() {
        let documents = documents_with(PROPOSAL).await;
        let config = EngineConfig::default();

        let report = SectionUpdater::new(&documents, &config)
            .update_sections(
                "doc",
                vec![
                    update(3, "precio final"),
                    update(1, "una introducción\nmucho más larga"),
                ],
            )
            .await
            .expect("expected update");

        assert_eq!(report.applied, vec![1, 3]);
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\nuna introducción\nmucho más larga\n2. Plan [DINÁMICO]\nold\n3. Costs\nprecio final\n")
        );
    }

    #[tokio::test]
    async fn last_section_keeps_the_final_newline() {
        let documents = documents_with("1. Intro\nhello\n2. Plan\n").await;
        let config = EngineConfig::default();
        let updater = SectionUpdater::new(&documents, &config);

        updater
            .update_sections("doc", vec![update(2, "primera versión")])
            .await
            .expect("expected update");
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\nhello\n2. Plan\nprimera versión\n")
        );

        updater
            .update_sections("doc", vec![update(2, "segunda")])
            .await
            .expect("expected update");
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\nhello\n2. Plan\nsegunda\n")
        );
    }

    #[tokio::test]
    async fn missing_and_static_sections_are_skipped() {
        let documents = documents_with("1. Alcance [ESTÁTICO]\nfijo\n2. Plan\nold\n").await;
        let config = EngineConfig::default();

        let report = SectionUpdater::new(&documents, &config)
            .update_sections(
                "doc",
                vec![update(1, "no"), update(7, "no"), update(2, "sí")],
            )
            .await
            .expect("expected update");

        assert_eq!(report.applied, vec![2]);
        let skipped = report
            .skipped
            .iter()
            .map(|entry| entry.order)
            .collect::<Vec<i64>>();
        assert_eq!(skipped, vec![1, 7]);
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Alcance [ESTÁTICO]\nfijo\n2. Plan\nsí\n")
        );
    }

    #[tokio::test]
    async fn declarations_override_markers_and_title_fallback_locates_sections() {
        let documents = documents_with("1. Alcance [ESTÁTICO]\nfijo\n2. Plan\nold\n").await;
        let config = EngineConfig::default();
        let declarations = vec![TemplateSection {
            order: 1,
            title: "Alcance".to_string(),
            is_static: false,
            is_dynamic: true,
        }];

        let report = SectionUpdater::new(&documents, &config)
            .with_declarations(Some(declarations.as_slice()))
            .update_sections(
                "doc",
                vec![
                    update(1, "alcance nuevo"),
                    SectionUpdate {
                        order: 9,
                        title: "PLAN".to_string(),
                        content: "plan nuevo".to_string(),
                    },
                ],
            )
            .await
            .expect("expected update");

        assert_eq!(report.applied, vec![1, 9]);
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Alcance [ESTÁTICO]\nalcance nuevo\n2. Plan\nplan nuevo\n")
        );
    }

    #[tokio::test]
    async fn numbered_list_content_does_not_capture_later_updates() {
        let documents = documents_with("1. Intro\nhello\n2. Plan\nold\n3. Costs\nfixed\n").await;
        let config = EngineConfig::default();

        let report = SectionUpdater::new(&documents, &config)
            .update_sections(
                "doc",
                vec![
                    SectionUpdate {
                        order: 1,
                        title: "Intro".to_string(),
                        content: "1. Análisis\n2. Diseño".to_string(),
                    },
                    SectionUpdate {
                        order: 2,
                        title: "Plan".to_string(),
                        content: "nuevo plan".to_string(),
                    },
                ],
            )
            .await
            .expect("expected update");

        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\n1. Análisis\n2. Diseño\n2. Plan\nnuevo plan\n3. Costs\nfixed\n")
        );
    }

    #[tokio::test]
    async fn title_breaks_ties_between_sections_sharing_an_order() {
        let documents =
            documents_with("1. Intro\nhello\n2. Anexo\nnotas\n2. Plan\nold\n").await;
        let config = EngineConfig::default();

        let report = SectionUpdater::new(&documents, &config)
            .update_sections(
                "doc",
                vec![SectionUpdate {
                    order: 2,
                    title: "Plan".to_string(),
                    content: "nuevo".to_string(),
                }],
            )
            .await
            .expect("expected update");

        assert_eq!(report.applied, vec![2]);
        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\nhello\n2. Anexo\nnotas\n2. Plan\nnuevo\n")
        );
    }

    struct FailingSecondEdit {
        inner: InMemoryDocuments,
        edits: AtomicUsize,
    }

    #[async_trait]
    impl DocumentApi for FailingSecondEdit {
        async fn get(&self, document_id: &str) -> EngineResult<StructuredDocument> {
            self.inner.get(document_id).await
        }

        async fn batch_edit(&self, document_id: &str, ops: &[EditOp]) -> EngineResult<()> {
            if self.edits.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(EngineError::Remote("service unavailable".to_string()));
            }
            self.inner.batch_edit(document_id, ops).await
        }
    }

    #[tokio::test]
    async fn remote_failure_aborts_the_remaining_sections() {
        let api = FailingSecondEdit {
            inner: documents_with(PROPOSAL).await,
            edits: AtomicUsize::new(0),
        };
        let config = EngineConfig::default();

        let error = SectionUpdater::new(&api, &config)
            .update_sections("doc", vec![update(1, "a"), update(2, "b"), update(3, "c")])
            .await
            .expect_err("expected remote failure");

        assert!(error.is_fatal_for_update());
        assert_eq!(api.edits.load(Ordering::SeqCst), 2);
        assert_eq!(
            api.inner.text("doc").await.as_deref(),
            Some("1. Intro\na\n2. Plan [DINÁMICO]\nold\n3. Costs\nfixed\n")
        );
    }

    #[tokio::test]
    async fn serialized_updates_of_one_document_both_land() {
        let documents = documents_with(PROPOSAL).await;
        let config = EngineConfig::default();
        let locks = DocumentLocks::new();

        let (first, second) = tokio::join!(
            update_sections_serialized(&locks, &documents, &config, None, "doc", vec![update(1, "uno")]),
            update_sections_serialized(&locks, &documents, &config, None, "doc", vec![update(3, "tres")]),
        );
        first.expect("expected first update");
        second.expect("expected second update");

        assert_eq!(
            documents.text("doc").await.as_deref(),
            Some("1. Intro\nuno\n2. Plan [DINÁMICO]\nold\n3. Costs\ntres\n")
        );
    }
}
