use std::io::Cursor;

use docx_rs::{Docx, Paragraph, Run};

use crate::error::{EngineError, EngineResult};
use crate::types::Section;

const TITLE_SIZE: usize = 28;

fn section_heading(section: &Section) -> String {
    if section.order == 0 {
        section.title.clone()
    } else {
        format!("{}. {}", section.order, section.title)
    }
}

/// Plain package with one bold heading per section and one paragraph per
/// content line. Formatting, images and page setup of the sources are lost.
pub fn build_simplified_document(sections: &[Section]) -> EngineResult<Vec<u8>> {
    let mut docx = Docx::new();

    for section in sections {
        docx = docx.add_paragraph(
            Paragraph::new().add_run(
                Run::new()
                    .add_text(section_heading(section))
                    .bold()
                    .size(TITLE_SIZE),
            ),
        );

        if section.content.is_empty() {
            continue;
        }
        for line in section.content.lines() {
            let paragraph = if line.is_empty() {
                Paragraph::new()
            } else {
                Paragraph::new().add_run(Run::new().add_text(line))
            };
            docx = docx.add_paragraph(paragraph);
        }
    }

    let mut output = Cursor::new(Vec::new());
    docx.build().pack(&mut output).map_err(|error| {
        EngineError::Package(format!("could not write simplified document: {error}"))
    })?;

    tracing::debug!(sections = sections.len(), "built simplified document");
    Ok(output.into_inner())
}

#[cfg(test)]
mod tests {
    use super::build_simplified_document;
    use crate::config::EngineConfig;
    use crate::docx_parse::{package_nodes, parse_package_sections};
    use crate::types::Section;

    #[test]
    fn writes_numbered_headings_and_content_lines() {
        let sections = vec![
            Section::new(0, "Introducción", "Estimado cliente"),
            Section::new(1, "Alcance", "Primera línea\nSegunda línea"),
            Section::new(2, "Plan", ""),
        ];

        let bytes = build_simplified_document(&sections).expect("expected document");
        assert!(bytes.starts_with(b"PK\x03\x04"));

        let texts = package_nodes(&bytes)
            .expect("expected readable package")
            .into_iter()
            .map(|node| node.text)
            .collect::<Vec<String>>();
        assert_eq!(
            texts,
            vec![
                "Introducción",
                "Estimado cliente",
                "1. Alcance",
                "Primera línea",
                "Segunda línea",
                "2. Plan",
            ]
        );
    }

    #[test]
    fn output_parses_back_into_the_same_sections() {
        let sections = vec![
            Section::new(1, "Alcance", "texto fijo"),
            Section::new(3, "Costos", "precio"),
        ];
        let bytes = build_simplified_document(&sections).expect("expected document");

        let parsed = parse_package_sections(&bytes, &EngineConfig::default())
            .expect("expected sections");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].order, 3);
        assert_eq!(parsed[1].title, "Costos");
        assert_eq!(parsed[1].content, "precio");
    }
}
