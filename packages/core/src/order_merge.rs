use std::collections::BTreeMap;

use serde::Serialize;

use crate::classify::declarations_by_order;
use crate::types::{
    MergedSection, OrderConflict, Section, SectionKind, SectionSource, TemplateSection,
};
use crate::util::normalize_title;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMerge {
    pub sections: Vec<MergedSection>,
    pub conflicts: Vec<OrderConflict>,
}

/// Merges two section lists keyed by `order`, ascending. On a collision the
/// dynamic section replaces the static one; a section present on one side
/// only is kept from that side.
pub fn merge_by_order(static_source: Vec<Section>, dynamic_source: Vec<Section>) -> OrderMerge {
    let mut by_order = BTreeMap::<i64, MergedSection>::new();
    let mut conflicts = Vec::new();

    for section in static_source {
        by_order.insert(
            section.order,
            MergedSection {
                section,
                source: SectionSource::Static,
            },
        );
    }

    for section in dynamic_source {
        let order = section.order;
        if let Some(existing) = by_order.get(&order) {
            let titles_match =
                normalize_title(&existing.section.title) == normalize_title(&section.title);
            if existing.source == SectionSource::Static && !titles_match {
                tracing::warn!(
                    order,
                    static_title = %existing.section.title,
                    dynamic_title = %section.title,
                    "dynamic section replaces a static section with a different title"
                );
                conflicts.push(OrderConflict {
                    order,
                    static_title: existing.section.title.clone(),
                    dynamic_title: section.title.clone(),
                });
            }
        }

        by_order.insert(
            order,
            MergedSection {
                section,
                source: SectionSource::Dynamic,
            },
        );
    }

    OrderMerge {
        sections: by_order.into_values().collect(),
        conflicts,
    }
}

/// Skeleton variant used when opening a fresh in-progress document: static
/// sections keep their content, every section classified dynamic comes back
/// with empty content no matter which side supplied it. Inputs are expected
/// to be classified already; declarations still win per order.
pub fn merge_with_empty_dynamic(
    static_source: Vec<Section>,
    dynamic_source: Vec<Section>,
    declarations: Option<&[TemplateSection]>,
) -> OrderMerge {
    let mut merged = merge_by_order(static_source, dynamic_source);
    let by_order = declarations_by_order(declarations);

    for entry in &mut merged.sections {
        let kind = by_order
            .get(&entry.section.order)
            .map(|declaration| declaration.kind())
            .unwrap_or_else(|| entry.section.kind());
        entry.section.set_kind(kind);
        if kind == SectionKind::Dynamic {
            entry.section.content.clear();
        }
    }

    merged
}
