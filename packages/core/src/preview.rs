use roxmltree::{Document, Node};

use crate::docx_parse::{
    attribute_value, body_blocks, detect_heading_level, document_body, extract_paragraph_text,
    extract_table_text, has_tag, open_package, read_style_map, read_zip_file, DOCUMENT_PART,
    STYLES_PART,
};
use crate::error::{EngineError, EngineResult};
use crate::types::ExtractedDocument;
use crate::util::html_escape;

fn push_escaped_text_with_breaks(target: &mut String, text: &str) {
    for (index, segment) in text.split('\n').enumerate() {
        if index > 0 {
            target.push_str("<br/>");
        }
        target.push_str(&html_escape(segment));
    }
}

fn run_properties_node<'a>(run: Node<'a, 'a>) -> Option<Node<'a, 'a>> {
    run.children().find(|node| has_tag(*node, "rPr"))
}

fn run_has_property(run: Node<'_, '_>, property_tag: &str) -> bool {
    let Some(props) = run_properties_node(run) else {
        return false;
    };
    let Some(property) = props.children().find(|node| has_tag(*node, property_tag)) else {
        return false;
    };

    // <w:b w:val="0"/> switches the property off.
    !matches!(
        attribute_value(property, "val"),
        Some("0") | Some("false") | Some("none")
    )
}

fn render_run(run: Node<'_, '_>) -> String {
    let mut body = String::new();
    for node in run.descendants().filter(|node| node.is_element()) {
        if has_tag(node, "t") {
            if let Some(text) = node.text() {
                push_escaped_text_with_breaks(&mut body, text);
            }
        } else if has_tag(node, "tab") {
            body.push('\t');
        } else if has_tag(node, "br") || has_tag(node, "cr") {
            body.push_str("<br/>");
        }
    }

    if body.is_empty() {
        return body;
    }

    if run_has_property(run, "u") {
        body = format!("<u>{body}</u>");
    }
    if run_has_property(run, "i") {
        body = format!("<em>{body}</em>");
    }
    if run_has_property(run, "b") {
        body = format!("<strong>{body}</strong>");
    }
    body
}

fn render_inline_nodes(node: Node<'_, '_>, output: &mut String) {
    if !node.is_element() {
        return;
    }

    if has_tag(node, "hyperlink") {
        let mut link_body = String::new();
        for child in node.children() {
            render_inline_nodes(child, &mut link_body);
        }
        if !link_body.is_empty() {
            output.push_str("<a>");
            output.push_str(&link_body);
            output.push_str("</a>");
        }
        return;
    }

    if has_tag(node, "r") {
        output.push_str(&render_run(node));
        return;
    }

    // Paragraph properties never carry visible text.
    if has_tag(node, "pPr") {
        return;
    }

    for child in node.children() {
        render_inline_nodes(child, output);
    }
}

fn render_paragraph(paragraph: Node<'_, '_>, heading_level: Option<i64>) -> String {
    let mut body = String::new();
    for child in paragraph.children() {
        render_inline_nodes(child, &mut body);
    }

    match heading_level {
        Some(level) => {
            let level = level.clamp(1, 6);
            format!("<h{level}>{body}</h{level}>")
        }
        None if body.trim().is_empty() => "<p>&nbsp;</p>".to_string(),
        None => format!("<p>{body}</p>"),
    }
}

fn render_table(table: Node<'_, '_>) -> String {
    let mut html = String::from("<table>");
    for row in table.children().filter(|node| has_tag(*node, "tr")) {
        html.push_str("<tr>");
        for cell in row.children().filter(|node| has_tag(*node, "tc")) {
            html.push_str("<td>");
            for paragraph in cell.children().filter(|node| has_tag(*node, "p")) {
                html.push_str(&render_paragraph(paragraph, None));
            }
            html.push_str("</td>");
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");
    html
}

/// Plain text and light HTML of a Word package, in body order.
pub fn extract_document(bytes: &[u8]) -> EngineResult<ExtractedDocument> {
    let mut archive = open_package(bytes)?;
    let document_xml = read_zip_file(&mut archive, DOCUMENT_PART)
        .ok_or_else(|| EngineError::MissingPart(DOCUMENT_PART.to_string()))?;
    let style_map = read_style_map(read_zip_file(&mut archive, STYLES_PART));

    let document = Document::parse(&document_xml)?;
    let body = document_body(&document)?;

    let mut lines = Vec::new();
    let mut html = String::new();
    for block in body_blocks(body) {
        if has_tag(block, "tbl") {
            lines.push(extract_table_text(block));
            html.push_str(&render_table(block));
        } else {
            lines.push(extract_paragraph_text(block));
            html.push_str(&render_paragraph(
                block,
                detect_heading_level(block, &style_map),
            ));
        }
    }

    Ok(ExtractedDocument {
        text: lines.join("\n"),
        html,
    })
}
