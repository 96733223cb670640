use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};

use roxmltree::{Document, Node};
use zip::ZipArchive;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::section_parse::SectionParser;
use crate::types::{ContentNode, NodeKind, Section};

pub(crate) const DOCUMENT_PART: &str = "word/document.xml";
pub(crate) const DOCUMENT_RELS_PART: &str = "word/_rels/document.xml.rels";
pub(crate) const STYLES_PART: &str = "word/styles.xml";
pub(crate) const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

pub(crate) fn has_tag(node: Node<'_, '_>, expected: &str) -> bool {
    node.is_element() && node.tag_name().name() == expected
}

pub(crate) fn attribute_value<'a>(node: Node<'a, 'a>, key: &str) -> Option<&'a str> {
    if let Some(value) = node.attribute(key) {
        return Some(value);
    }
    node.attributes()
        .find_map(|attribute| (attribute.name().ends_with(key)).then_some(attribute.value()))
}

pub(crate) fn parse_trailing_level(value: &str) -> Option<i64> {
    let lowered = value.to_ascii_lowercase();

    if let Some(without_h) = lowered.strip_prefix('h') {
        if let Ok(level) = without_h.parse::<i64>() {
            if (1..=9).contains(&level) {
                return Some(level);
            }
        }
    }

    for label in ["heading", "titulo", "título"] {
        if let Some(index) = lowered.find(label) {
            let tail = &lowered[index + label.len()..];
            let digits: String = tail
                .chars()
                .filter(|character| character.is_ascii_digit())
                .collect();
            if let Ok(level) = digits.parse::<i64>() {
                if (1..=9).contains(&level) {
                    return Some(level);
                }
            }
        }
    }

    None
}

pub(crate) fn open_package(bytes: &[u8]) -> EngineResult<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|error| EngineError::Package(error.to_string()))
}

pub(crate) fn read_zip_file<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    entry_name: &str,
) -> Option<String> {
    let mut entry = archive.by_name(entry_name).ok()?;
    let mut value = String::new();
    entry.read_to_string(&mut value).ok()?;
    Some(value)
}

pub(crate) fn read_package_part(bytes: &[u8], part_name: &str) -> EngineResult<Option<String>> {
    let mut archive = open_package(bytes)?;
    Ok(read_zip_file(&mut archive, part_name))
}

pub(crate) fn read_document_xml(bytes: &[u8]) -> EngineResult<String> {
    read_package_part(bytes, DOCUMENT_PART)?
        .ok_or_else(|| EngineError::MissingPart(DOCUMENT_PART.to_string()))
}

pub(crate) fn read_style_map(styles_xml: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(styles_xml) = styles_xml else {
        return map;
    };

    let Ok(document) = Document::parse(&styles_xml) else {
        return map;
    };

    for style in document
        .descendants()
        .filter(|node| has_tag(*node, "style"))
    {
        let Some(style_id) = attribute_value(style, "styleId") else {
            continue;
        };

        let mut display_name = style_id.to_string();
        if let Some(name_node) = style.children().find(|node| has_tag(*node, "name")) {
            if let Some(value) = attribute_value(name_node, "val") {
                display_name = value.to_string();
            }
        }

        map.insert(style_id.to_string(), display_name);
    }

    map
}

pub(crate) fn detect_heading_level(
    paragraph: Node<'_, '_>,
    style_map: &HashMap<String, String>,
) -> Option<i64> {
    let paragraph_props = paragraph.children().find(|node| has_tag(*node, "pPr"))?;

    if let Some(outline_level_node) = paragraph_props
        .children()
        .find(|node| has_tag(*node, "outlineLvl"))
    {
        if let Some(raw_level) = attribute_value(outline_level_node, "val") {
            if let Ok(level_zero_based) = raw_level.parse::<i64>() {
                let level = level_zero_based + 1;
                if (1..=9).contains(&level) {
                    return Some(level);
                }
            }
        }
    }

    let style_node = paragraph_props
        .children()
        .find(|node| has_tag(*node, "pStyle"))?;
    let style_id = attribute_value(style_node, "val")?;

    if let Some(level) = parse_trailing_level(style_id) {
        return Some(level);
    }

    style_map
        .get(style_id)
        .and_then(|style_name| parse_trailing_level(style_name))
}

pub(crate) fn extract_paragraph_text(paragraph: Node<'_, '_>) -> String {
    let mut value = String::new();

    for node in paragraph.descendants().filter(|node| node.is_element()) {
        if has_tag(node, "t") {
            if let Some(text) = node.text() {
                value.push_str(text);
            }
        } else if has_tag(node, "tab") {
            value.push('\t');
        } else if has_tag(node, "br") || has_tag(node, "cr") {
            value.push('\n');
        }
    }

    value
}

pub(crate) fn extract_table_text(table: Node<'_, '_>) -> String {
    table
        .children()
        .filter(|node| has_tag(*node, "tr"))
        .map(|row| {
            row.children()
                .filter(|node| has_tag(*node, "tc"))
                .map(|cell| {
                    cell.descendants()
                        .filter(|node| has_tag(*node, "p"))
                        .map(extract_paragraph_text)
                        .collect::<Vec<String>>()
                        .join(" ")
                })
                .collect::<Vec<String>>()
                .join("\t")
        })
        .collect::<Vec<String>>()
        .join("\n")
}

pub(crate) fn document_body<'a, 'input>(
    document: &'a Document<'input>,
) -> EngineResult<Node<'a, 'input>> {
    document
        .descendants()
        .find(|node| has_tag(*node, "body"))
        .ok_or_else(|| EngineError::Structure("document has no <w:body> element".to_string()))
}

/// Top-level block elements of the body in document order. Content controls
/// are transparent: their blocks are yielded in place.
pub(crate) fn body_blocks<'a, 'input>(body: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
    let mut blocks = Vec::new();
    collect_blocks(body, &mut blocks);
    blocks
}

fn collect_blocks<'a, 'input>(parent: Node<'a, 'input>, blocks: &mut Vec<Node<'a, 'input>>) {
    for child in parent.children().filter(|node| node.is_element()) {
        if has_tag(child, "p") || has_tag(child, "tbl") {
            blocks.push(child);
        } else if has_tag(child, "sdt") {
            if let Some(content) = child.children().find(|node| has_tag(*node, "sdtContent")) {
                collect_blocks(content, blocks);
            }
        }
    }
}

pub fn package_nodes(bytes: &[u8]) -> EngineResult<Vec<ContentNode>> {
    let document_xml = read_document_xml(bytes)?;
    let document = Document::parse(&document_xml)?;
    let body = document_body(&document)?;

    Ok(body_blocks(body)
        .into_iter()
        .map(|block| {
            if has_tag(block, "tbl") {
                ContentNode {
                    kind: NodeKind::Table,
                    text: extract_table_text(block),
                    start_index: None,
                    end_index: None,
                }
            } else {
                ContentNode::line(extract_paragraph_text(block))
            }
        })
        .collect())
}

pub fn parse_package_sections(bytes: &[u8], config: &EngineConfig) -> EngineResult<Vec<Section>> {
    let nodes = package_nodes(bytes)?;
    Ok(SectionParser::new(config).parse_nodes(&nodes))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    pub(crate) const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
    pub(crate) const R_NS: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

    pub(crate) fn document_xml(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?><w:document xmlns:w=\"{W_NS}\" xmlns:r=\"{R_NS}\"><w:body>{body}</w:body></w:document>"
        )
    }

    pub(crate) fn paragraph(text: &str) -> String {
        format!("<w:p><w:r><w:t xml:space=\"preserve\">{text}</w:t></w:r></w:p>")
    }

    pub(crate) fn build_package(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("expected zip entry to start");
            writer.write_all(bytes).expect("expected zip entry to write");
        }
        writer
            .finish()
            .expect("expected zip to finish")
            .into_inner()
    }

    pub(crate) fn simple_package(body: &str) -> Vec<u8> {
        let document = document_xml(body);
        build_package(&[("word/document.xml", document.as_bytes())])
    }
}
