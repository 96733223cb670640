use std::collections::HashMap;

use crate::types::{Section, SectionKind, TemplateSection};

/// Final kind of one section. Template declarations beat in-text markers,
/// markers beat the dynamic default.
fn resolve_kind(
    section: &Section,
    declarations: &HashMap<i64, &TemplateSection>,
) -> SectionKind {
    if let Some(declaration) = declarations.get(&section.order) {
        return declaration.kind();
    }
    section.marker.unwrap_or(SectionKind::Dynamic)
}

pub(crate) fn declarations_by_order(
    declarations: Option<&[TemplateSection]>,
) -> HashMap<i64, &TemplateSection> {
    declarations
        .unwrap_or_default()
        .iter()
        .map(|declaration| (declaration.order, declaration))
        .collect()
}

pub fn resolve_classification(
    sections: Vec<Section>,
    declarations: Option<&[TemplateSection]>,
) -> Vec<Section> {
    let by_order = declarations_by_order(declarations);

    sections
        .into_iter()
        .map(|mut section| {
            let kind = resolve_kind(&section, &by_order);
            if section.marker.is_some_and(|marker| marker != kind) {
                tracing::debug!(
                    order = section.order,
                    title = %section.title,
                    "template declaration overrides in-text marker"
                );
            }
            section.set_kind(kind);
            section
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::resolve_classification;
    use crate::types::{Section, SectionKind, TemplateSection};

    fn marked(order: i64, marker: Option<SectionKind>) -> Section {
        let mut section = Section::new(order, format!("Sección {order}"), "texto");
        if let Some(kind) = marker {
            section.set_kind(kind);
        }
        section.marker = marker;
        section
    }

    fn declaration(order: i64, is_static: bool, is_dynamic: bool) -> TemplateSection {
        TemplateSection {
            order,
            title: String::new(),
            is_static,
            is_dynamic,
        }
    }

    #[test]
    fn template_dynamic_declaration_beats_static_marker() {
        let sections = vec![marked(1, Some(SectionKind::Static)), marked(2, None)];
        let declarations = vec![declaration(1, false, true), declaration(2, false, true)];

        let resolved = resolve_classification(sections, Some(declarations.as_slice()));
        for section in &resolved {
            assert!(section.is_dynamic, "order {}", section.order);
            assert!(!section.is_static, "order {}", section.order);
        }
    }

    #[test]
    fn template_forces_static_off_when_both_flags_are_declared() {
        let resolved = resolve_classification(
            vec![marked(3, Some(SectionKind::Static))],
            Some(&[declaration(3, true, true)][..]),
        );
        assert_eq!(resolved[0].kind(), SectionKind::Dynamic);
        assert!(!resolved[0].is_static);
    }

    #[test]
    fn markers_apply_when_no_declaration_matches() {
        let resolved = resolve_classification(
            vec![marked(1, Some(SectionKind::Static)), marked(5, None)],
            Some(&[declaration(9, true, false)][..]),
        );
        assert_eq!(resolved[0].kind(), SectionKind::Static);
        assert_eq!(resolved[1].kind(), SectionKind::Dynamic);
    }

    #[test]
    fn unmarked_sections_default_to_dynamic() {
        let mut section = Section::new(4, "Costos", "");
        section.is_static = true;
        section.is_dynamic = false;

        let resolved = resolve_classification(vec![section], None);
        assert!(resolved[0].is_dynamic);
        assert!(!resolved[0].is_static);
    }

    #[test]
    fn static_declaration_beats_dynamic_marker() {
        let resolved = resolve_classification(
            vec![marked(2, Some(SectionKind::Dynamic))],
            Some(&[declaration(2, true, false)][..]),
        );
        assert_eq!(resolved[0].kind(), SectionKind::Static);
    }
}
