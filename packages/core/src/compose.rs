use rayon::prelude::*;
use serde::Serialize;

use crate::classify::resolve_classification;
use crate::config::EngineConfig;
use crate::docx_build::build_simplified_document;
use crate::docx_merge::{merge_packages, MergedPackage};
use crate::docx_parse::parse_package_sections;
use crate::error::EngineResult;
use crate::order_merge::{merge_by_order, merge_with_empty_dynamic};
use crate::section_parse::parse_sections;
use crate::types::{MergedSection, OrderConflict, Section, TemplateSection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationStrategy {
    PackageMerge,
    SimplifiedFallback,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDocument {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub strategy: GenerationStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergedPackage>,
    pub conflicts: Vec<OrderConflict>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Skeleton {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub sections: Vec<MergedSection>,
    pub conflicts: Vec<OrderConflict>,
}

/// Final proposal from the dynamic (primary) and static (secondary) Word
/// files. A failed package merge degrades to a document rebuilt from the
/// sections of both files.
///
/// `declarations` only apply on that fallback path: the package merge keeps
/// both bodies whole and never classifies sections, so its result carries
/// no order conflicts.
pub fn generate_proposal(
    dynamic_package: &[u8],
    static_package: &[u8],
    declarations: Option<&[TemplateSection]>,
    config: &EngineConfig,
) -> EngineResult<GeneratedDocument> {
    match merge_packages(dynamic_package, static_package, config) {
        Ok(merged) => Ok(GeneratedDocument {
            bytes: merged.bytes.clone(),
            strategy: GenerationStrategy::PackageMerge,
            fallback_reason: None,
            merge: Some(merged),
            conflicts: Vec::new(),
        }),
        Err(error) => {
            tracing::warn!(%error, "package merge failed, building simplified document");
            let static_sections =
                resolve_classification(parse_package_sections(static_package, config)?, declarations);
            let dynamic_sections =
                resolve_classification(parse_package_sections(dynamic_package, config)?, declarations);

            let merged = merge_by_order(static_sections, dynamic_sections);
            let sections = merged
                .sections
                .into_iter()
                .map(|entry| entry.section)
                .collect::<Vec<Section>>();

            Ok(GeneratedDocument {
                bytes: build_simplified_document(&sections)?,
                strategy: GenerationStrategy::SimplifiedFallback,
                fallback_reason: Some(error.to_string()),
                merge: None,
                conflicts: merged.conflicts,
            })
        }
    }
}

/// In-progress document: static sections with their text, every dynamic
/// section reduced to its title.
pub fn build_skeleton(
    static_text: &str,
    dynamic_text: &str,
    declarations: Option<&[TemplateSection]>,
    config: &EngineConfig,
) -> EngineResult<Skeleton> {
    let static_sections = resolve_classification(parse_sections(static_text, config), declarations);
    let dynamic_sections =
        resolve_classification(parse_sections(dynamic_text, config), declarations);

    let merged = merge_with_empty_dynamic(static_sections, dynamic_sections, declarations);
    let sections = merged
        .sections
        .iter()
        .map(|entry| entry.section.clone())
        .collect::<Vec<Section>>();
    let bytes = build_simplified_document(&sections)?;

    tracing::debug!(sections = sections.len(), "built proposal skeleton");
    Ok(Skeleton {
        bytes,
        sections: merged.sections,
        conflicts: merged.conflicts,
    })
}

/// Independent merges share nothing, so pairs run in parallel. Results keep
/// the input order.
pub fn merge_package_pairs(
    pairs: &[(Vec<u8>, Vec<u8>)],
    config: &EngineConfig,
) -> Vec<EngineResult<MergedPackage>> {
    pairs
        .par_iter()
        .map(|(primary, secondary)| merge_packages(primary, secondary, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{build_skeleton, generate_proposal, merge_package_pairs, GenerationStrategy};
    use crate::config::EngineConfig;
    use crate::docx_parse::{parse_package_sections, read_package_part};
    use crate::docx_parse::test_support::{build_package, document_xml, paragraph, simple_package};
    use crate::types::{SectionSource, TemplateSection};

    fn dynamic_package() -> Vec<u8> {
        simple_package(&format!(
            "{}{}<w:sectPr/>",
            paragraph("2. Plan"),
            paragraph("plan del cliente")
        ))
    }

    fn static_package() -> Vec<u8> {
        simple_package(&format!(
            "{}{}",
            paragraph("1. Alcance [ESTÁTICO]"),
            paragraph("texto legal")
        ))
    }

    #[test]
    fn generates_by_package_merge_when_possible() {
        let generated = generate_proposal(
            &dynamic_package(),
            &static_package(),
            None,
            &EngineConfig::default(),
        )
        .expect("expected generation");

        assert_eq!(generated.strategy, GenerationStrategy::PackageMerge);
        assert!(generated.fallback_reason.is_none());

        let sections = parse_package_sections(&generated.bytes, &EngineConfig::default())
            .expect("expected sections");
        let orders = sections.iter().map(|section| section.order).collect::<Vec<i64>>();
        assert_eq!(orders, vec![1, 2]);
    }

    #[test]
    fn falls_back_to_simplified_document_on_merge_failure() {
        // Body is present but a relationship reference cannot be resolved.
        let broken_static = build_package(&[(
            "word/document.xml",
            document_xml(&format!(
                "{}{}<w:p><w:hyperlink r:id=\"rId42\"/></w:p>",
                paragraph("1. Alcance [ESTÁTICO]"),
                paragraph("texto legal")
            ))
            .as_bytes(),
        )]);

        let generated = generate_proposal(
            &dynamic_package(),
            &broken_static,
            None,
            &EngineConfig::default(),
        )
        .expect("expected fallback generation");

        assert_eq!(generated.strategy, GenerationStrategy::SimplifiedFallback);
        assert!(generated.fallback_reason.is_some());

        let sections = parse_package_sections(&generated.bytes, &EngineConfig::default())
            .expect("expected sections");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Alcance");
        assert_eq!(sections[0].content, "texto legal");
        assert_eq!(sections[1].content, "plan del cliente");
    }

    #[test]
    fn declarations_do_not_affect_the_package_merge() {
        let declarations = vec![TemplateSection {
            order: 1,
            title: "Otro título".to_string(),
            is_static: false,
            is_dynamic: true,
        }];
        let with_declarations = generate_proposal(
            &dynamic_package(),
            &static_package(),
            Some(declarations.as_slice()),
            &EngineConfig::default(),
        )
        .expect("expected generation");
        let without = generate_proposal(
            &dynamic_package(),
            &static_package(),
            None,
            &EngineConfig::default(),
        )
        .expect("expected generation");

        assert_eq!(with_declarations.strategy, GenerationStrategy::PackageMerge);
        assert!(with_declarations.conflicts.is_empty());
        assert_eq!(
            read_package_part(&with_declarations.bytes, "word/document.xml")
                .expect("expected package"),
            read_package_part(&without.bytes, "word/document.xml").expect("expected package")
        );
    }

    #[test]
    fn unreadable_inputs_still_fail() {
        let result = generate_proposal(
            b"not a zip",
            &static_package(),
            None,
            &EngineConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn skeleton_clears_dynamic_sections() {
        let declarations = vec![TemplateSection {
            order: 3,
            title: "Costos".to_string(),
            is_static: true,
            is_dynamic: false,
        }];
        let skeleton = build_skeleton(
            "1. Alcance [ESTÁTICO]\ntexto legal\n3. Costos\ntarifa base",
            "2. Plan\nborrador\n3. Costos\ntarifa cliente",
            Some(declarations.as_slice()),
            &EngineConfig::default(),
        )
        .expect("expected skeleton");

        assert_eq!(skeleton.sections.len(), 3);
        assert_eq!(skeleton.sections[0].section.content, "texto legal");
        assert_eq!(skeleton.sections[1].section.content, "");
        assert_eq!(skeleton.sections[2].section.content, "tarifa cliente");
        assert_eq!(skeleton.sections[2].source, SectionSource::Dynamic);

        let written = parse_package_sections(&skeleton.bytes, &EngineConfig::default())
            .expect("expected sections");
        assert_eq!(written[1].title, "Plan");
        assert_eq!(written[1].content, "");
    }

    #[test]
    fn merges_pairs_in_input_order() {
        let pairs = vec![
            (dynamic_package(), static_package()),
            (dynamic_package(), b"broken".to_vec()),
        ];
        let results = merge_package_pairs(&pairs, &EngineConfig::default());

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
