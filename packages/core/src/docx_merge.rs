//! Merges a secondary (static) Word package into a primary (dynamic) one.
//!
//! Bodies are spliced textually: secondary body without any `sectPr`, then
//! the primary body without its trailing `sectPr`, then that trailing
//! `sectPr` once, so the primary's page setup governs the result.
//! Relationship ids, media, styles, namespaces and content types referenced
//! by the spliced content are reconciled before the package is written.
//!
//! Only secondary relationships that the spliced body references are added
//! to the primary relationship part. Secondary relationships nothing points
//! at (headers, footers, the secondary's own settings) are left behind;
//! unreferenced secondary media files are still copied into the package.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use roxmltree::Document;
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::EngineConfig;
use crate::docx_parse::{
    attribute_value, has_tag, CONTENT_TYPES_PART, DOCUMENT_PART, DOCUMENT_RELS_PART, STYLES_PART,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{RelationshipDef, SourceStyleDefinition};
use crate::util::xml_escape_attr;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const EMPTY_RELATIONSHIPS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?><Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\"></Relationships>";
const MEDIA_PREFIX: &str = "word/media/";

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPackage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub paragraph_count: usize,
    pub relationships_added: usize,
    pub media_copied: usize,
}

struct PackageEntry {
    name: String,
    data: Vec<u8>,
}

/// Every file entry of a package, in archive order.
pub(crate) struct Package {
    entries: Vec<PackageEntry>,
}

impl Package {
    pub(crate) fn read(bytes: &[u8]) -> EngineResult<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|error| EngineError::Package(error.to_string()))?;
        let mut entries = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            entries.push(PackageEntry { name, data });
        }

        Ok(Self { entries })
    }

    pub(crate) fn part(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.data.as_slice())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.part(name).is_some()
    }

    pub(crate) fn part_text(&self, name: &str) -> EngineResult<Option<String>> {
        let Some(data) = self.part(name) else {
            return Ok(None);
        };
        String::from_utf8(data.to_vec())
            .map(Some)
            .map_err(|_| EngineError::Package(format!("part '{name}' is not valid UTF-8")))
    }

    fn required_text(&self, name: &str) -> EngineResult<String> {
        self.part_text(name)?
            .ok_or_else(|| EngineError::MissingPart(name.to_string()))
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }
}

fn is_tag_boundary(character: Option<char>) -> bool {
    matches!(character, Some(' ' | '>' | '/' | '\t' | '\r' | '\n'))
}

/// Position of the next `<tag` opening (or self-closing) tag at or after `from`.
fn find_open_tag(xml: &str, tag: &str, from: usize) -> Option<usize> {
    let needle = format!("<{tag}");
    let mut cursor = from;
    while let Some(offset) = xml[cursor..].find(&needle) {
        let start = cursor + offset;
        if is_tag_boundary(xml[start + needle.len()..].chars().next()) {
            return Some(start);
        }
        cursor = start + needle.len();
    }
    None
}

fn count_open_tags(xml: &str, tag: &str) -> usize {
    let mut count = 0;
    let mut cursor = 0;
    while let Some(start) = find_open_tag(xml, tag, cursor) {
        count += 1;
        cursor = start + tag.len() + 1;
    }
    count
}

/// Index just past the element opened at `start`, honoring nested elements
/// of the same name (a `sectPrChange` carries its own `sectPr`).
fn element_end(xml: &str, tag: &str, start: usize) -> Option<usize> {
    let close = format!("</{tag}>");
    let mut depth = 0_usize;
    let mut cursor = start;

    loop {
        let next_open = find_open_tag(xml, tag, cursor);
        let next_close = xml[cursor..].find(&close).map(|offset| cursor + offset);

        match (next_open, next_close) {
            (Some(open), close_at) if close_at.map_or(true, |close_at| open < close_at) => {
                let tag_end = open + xml[open..].find('>')?;
                if xml[..tag_end].ends_with('/') {
                    if depth == 0 {
                        return Some(tag_end + 1);
                    }
                } else {
                    depth += 1;
                }
                cursor = tag_end + 1;
            }
            (_, Some(close_at)) => {
                depth = depth.checked_sub(1)?;
                cursor = close_at + close.len();
                if depth == 0 {
                    return Some(cursor);
                }
            }
            _ => return None,
        }
    }
}

/// Spans of every outermost `<tag>` element in `xml`.
fn element_spans(xml: &str, tag: &str) -> EngineResult<Vec<(usize, usize)>> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(start) = find_open_tag(xml, tag, cursor) {
        let end = element_end(xml, tag, start)
            .ok_or_else(|| EngineError::Structure(format!("unterminated <{tag}> element")))?;
        spans.push((start, end));
        cursor = end;
    }
    Ok(spans)
}

pub(crate) fn body_bounds(document_xml: &str) -> EngineResult<(usize, usize)> {
    let body_open = find_open_tag(document_xml, "w:body", 0)
        .ok_or_else(|| EngineError::Structure("could not find <w:body> in document.xml".to_string()))?;
    let body_open_end = document_xml[body_open..]
        .find('>')
        .map(|offset| body_open + offset + 1)
        .ok_or_else(|| EngineError::Structure("could not parse <w:body> opening tag".to_string()))?;
    let body_close = document_xml
        .rfind("</w:body>")
        .filter(|close| *close >= body_open_end)
        .ok_or_else(|| EngineError::Structure("could not find </w:body> in document.xml".to_string()))?;

    Ok((body_open_end, body_close))
}

/// Splits off the body's final `sectPr` when nothing but whitespace follows it.
pub(crate) fn take_trailing_sect_pr(body: &str) -> EngineResult<(String, Option<String>)> {
    let spans = element_spans(body, "w:sectPr")?;
    match spans.last() {
        Some((start, end)) if body[*end..].trim().is_empty() => Ok((
            body[..*start].to_string(),
            Some(body[*start..*end].to_string()),
        )),
        _ => Ok((body.to_string(), None)),
    }
}

/// Removes every `sectPr`, including section breaks nested in paragraph
/// properties. Returns the cleaned body and how many were removed.
pub(crate) fn strip_sect_pr(body: &str) -> EngineResult<(String, usize)> {
    let spans = element_spans(body, "w:sectPr")?;
    let mut cleaned = String::with_capacity(body.len());
    let mut cursor = 0;
    for (start, end) in &spans {
        cleaned.push_str(&body[cursor..*start]);
        cursor = *end;
    }
    cleaned.push_str(&body[cursor..]);
    Ok((cleaned, spans.len()))
}

pub(crate) fn count_paragraphs(xml: &str) -> usize {
    count_open_tags(xml, "w:p")
}

pub(crate) fn validate_merged_document(document_xml: &str) -> EngineResult<usize> {
    let body_opens = count_open_tags(document_xml, "w:body");
    let body_closes = document_xml.matches("</w:body>").count();
    if body_opens != 1 || body_closes != 1 {
        return Err(EngineError::Structure(format!(
            "expected exactly one body element, found {body_opens} opening and {body_closes} closing tags"
        )));
    }

    let paragraph_count = count_paragraphs(document_xml);
    if paragraph_count == 0 {
        return Err(EngineError::Structure(
            "merged document has no paragraphs".to_string(),
        ));
    }

    Document::parse(document_xml).map_err(|error| {
        EngineError::Structure(format!("merged document.xml is not well-formed: {error}"))
    })?;

    Ok(paragraph_count)
}

fn namespace_regex() -> &'static Regex {
    static NAMESPACE: OnceLock<Regex> = OnceLock::new();
    NAMESPACE.get_or_init(|| {
        Regex::new(r#"xmlns:([A-Za-z_][\w.\-]*)\s*=\s*"([^"]*)""#).expect("namespace regex is valid")
    })
}

fn ignorable_regex() -> &'static Regex {
    static IGNORABLE: OnceLock<Regex> = OnceLock::new();
    IGNORABLE.get_or_init(|| {
        Regex::new(r#"mc:Ignorable\s*=\s*"([^"]*)""#).expect("ignorable regex is valid")
    })
}

fn root_open_tag(document_xml: &str) -> EngineResult<(usize, usize)> {
    let start = find_open_tag(document_xml, "w:document", 0).ok_or_else(|| {
        EngineError::Structure("could not find <w:document> root element".to_string())
    })?;
    let end = document_xml[start..]
        .find('>')
        .map(|offset| start + offset)
        .ok_or_else(|| EngineError::Structure("could not parse <w:document> tag".to_string()))?;
    Ok((start, end))
}

/// Adds to the primary root every namespace declaration the secondary root
/// has and the primary lacks, and unions their `mc:Ignorable` lists.
pub(crate) fn merge_root_namespaces(primary_xml: &str, secondary_xml: &str) -> EngineResult<String> {
    let (primary_start, primary_end) = root_open_tag(primary_xml)?;
    let (secondary_start, secondary_end) = root_open_tag(secondary_xml)?;
    let primary_tag = &primary_xml[primary_start..primary_end];
    let secondary_tag = &secondary_xml[secondary_start..secondary_end];

    let mut declared = namespace_regex()
        .captures_iter(primary_tag)
        .filter_map(|captures| captures.get(1).map(|prefix| prefix.as_str().to_string()))
        .collect::<HashSet<String>>();

    let mut additions = String::new();
    for captures in namespace_regex().captures_iter(secondary_tag) {
        let (Some(prefix), Some(uri)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        if declared.insert(prefix.as_str().to_string()) {
            additions.push_str(&format!(" xmlns:{}=\"{}\"", prefix.as_str(), uri.as_str()));
        }
    }

    let mut merged_tag = format!("{primary_tag}{additions}");

    let secondary_ignorable = ignorable_regex()
        .captures(secondary_tag)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().split_whitespace().collect::<Vec<&str>>())
        .unwrap_or_default();
    if !secondary_ignorable.is_empty() && declared.contains("mc") {
        let primary_ignorable = ignorable_regex()
            .captures(&merged_tag)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().to_string());

        let mut prefixes = primary_ignorable
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<String>>();
        for prefix in secondary_ignorable {
            if declared.contains(prefix) && !prefixes.iter().any(|existing| existing == prefix) {
                prefixes.push(prefix.to_string());
            }
        }

        let attribute = format!("mc:Ignorable=\"{}\"", prefixes.join(" "));
        merged_tag = if primary_ignorable.is_some() {
            ignorable_regex()
                .replace(&merged_tag, attribute.as_str())
                .into_owned()
        } else {
            format!("{merged_tag} {attribute}")
        };
    }

    let mut merged = String::with_capacity(primary_xml.len() + merged_tag.len());
    merged.push_str(&primary_xml[..primary_start]);
    merged.push_str(&merged_tag);
    merged.push_str(&primary_xml[primary_end..]);
    Ok(merged)
}

fn relationship_reference_regex() -> &'static Regex {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    REFERENCE.get_or_init(|| {
        Regex::new(r#"(\sr:(?:id|embed|link|pict|dm|lo|qs|cs)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
            .expect("relationship reference regex is valid")
    })
}

fn captured_reference<'a>(captures: &'a Captures<'_>) -> &'a str {
    captures
        .get(2)
        .or_else(|| captures.get(3))
        .map(|value| value.as_str())
        .unwrap_or_default()
}

pub(crate) fn referenced_relationship_ids(xml: &str) -> BTreeSet<String> {
    relationship_reference_regex()
        .captures_iter(xml)
        .map(|captures| captured_reference(&captures).to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Rewrites relationship references in one pass so chained remaps
/// (`rId1 -> rId5`, `rId5 -> rId9`) cannot collide.
pub(crate) fn remap_relationship_ids(xml: &str, id_remap: &HashMap<String, String>) -> String {
    if id_remap.is_empty() {
        return xml.to_string();
    }

    relationship_reference_regex()
        .replace_all(xml, |captures: &Captures<'_>| {
            let prefix = captures.get(1).map(|value| value.as_str()).unwrap_or_default();
            let id = captured_reference(captures);
            let mapped = id_remap.get(id).map(String::as_str).unwrap_or(id);
            format!("{prefix}\"{mapped}\"")
        })
        .into_owned()
}

pub(crate) fn parse_relationships(relationships_xml: &str) -> BTreeMap<String, RelationshipDef> {
    let mut relationships = BTreeMap::new();
    let Ok(document) = Document::parse(relationships_xml) else {
        return relationships;
    };

    for relationship in document
        .descendants()
        .filter(|node| has_tag(*node, "Relationship"))
    {
        let Some(id) = attribute_value(relationship, "Id") else {
            continue;
        };
        let Some(rel_type) = attribute_value(relationship, "Type") else {
            continue;
        };
        let Some(target) = attribute_value(relationship, "Target") else {
            continue;
        };
        let target_mode = attribute_value(relationship, "TargetMode").map(str::to_string);

        relationships.insert(
            id.to_string(),
            RelationshipDef {
                rel_type: rel_type.to_string(),
                target: target.to_string(),
                target_mode,
            },
        );
    }

    relationships
}

fn highest_relationship_number<'a>(ids: impl Iterator<Item = &'a String>) -> i64 {
    ids.filter_map(|id| id.strip_prefix("rId"))
        .filter_map(|raw| raw.parse::<i64>().ok())
        .max()
        .unwrap_or(0)
}

fn relationship_xml(id: &str, definition: &RelationshipDef) -> String {
    let mut xml = format!(
        "<Relationship Id=\"{}\" Type=\"{}\" Target=\"{}\"",
        xml_escape_attr(id),
        xml_escape_attr(&definition.rel_type),
        xml_escape_attr(&definition.target)
    );
    if let Some(target_mode) = &definition.target_mode {
        xml.push_str(&format!(" TargetMode=\"{}\"", xml_escape_attr(target_mode)));
    }
    xml.push_str("/>");
    xml
}

fn append_relationships(
    relationships_xml: &str,
    appended: &[(String, RelationshipDef)],
) -> EngineResult<String> {
    if appended.is_empty() {
        return Ok(relationships_xml.to_string());
    }

    let close_index = relationships_xml.rfind("</Relationships>").ok_or_else(|| {
        EngineError::Resource("relationship part has no closing </Relationships> tag".to_string())
    })?;

    let mut updated = String::with_capacity(relationships_xml.len() + appended.len() * 128);
    updated.push_str(&relationships_xml[..close_index]);
    for (id, definition) in appended {
        updated.push_str(&relationship_xml(id, definition));
    }
    updated.push_str(&relationships_xml[close_index..]);
    Ok(updated)
}

fn parent_dir(part_name: &str) -> &str {
    part_name
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or_default()
}

/// Package part addressed by a relationship target relative to `base_dir`.
pub(crate) fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }

    let mut segments = base_dir
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<&str>>();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn relationships_part_for(part_name: &str) -> String {
    match part_name.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part_name}.rels"),
    }
}

fn file_name(part_name: &str) -> &str {
    part_name
        .rsplit_once('/')
        .map(|(_, file)| file)
        .unwrap_or(part_name)
}

/// `target` with its last segment swapped for the file name of `part_name`.
fn retarget(target: &str, part_name: &str) -> String {
    match target.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{}", file_name(part_name)),
        None => file_name(part_name).to_string(),
    }
}

/// Copies secondary parts into the output, deduplicating identical media by
/// digest and renaming on path collisions with different bytes.
struct ResourceCopier<'a> {
    primary: &'a Package,
    secondary: &'a Package,
    primary_media: HashMap<blake3::Hash, String>,
    imported: HashMap<String, String>,
    taken: HashSet<String>,
    additions: Vec<(String, Vec<u8>)>,
    renamed: Vec<(String, String)>,
}

impl<'a> ResourceCopier<'a> {
    fn new(primary: &'a Package, secondary: &'a Package) -> Self {
        let primary_media = primary
            .entries
            .iter()
            .filter(|entry| entry.name.starts_with(MEDIA_PREFIX))
            .map(|entry| (blake3::hash(&entry.data), entry.name.clone()))
            .collect();

        Self {
            primary,
            secondary,
            primary_media,
            imported: HashMap::new(),
            taken: primary.names().map(str::to_string).collect(),
            additions: Vec::new(),
            renamed: Vec::new(),
        }
    }

    fn unique_name(&self, part_name: &str) -> String {
        let dir = parent_dir(part_name);
        let file = file_name(part_name);
        let (stem, extension) = match file.rsplit_once('.') {
            Some((stem, extension)) => (stem, format!(".{extension}")),
            None => (file, String::new()),
        };

        let mut counter = 1_usize;
        loop {
            let candidate = if dir.is_empty() {
                format!("{stem}_{counter}{extension}")
            } else {
                format!("{dir}/{stem}_{counter}{extension}")
            };
            if !self.taken.contains(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Name under which `source_name` is available in the output package.
    fn import(&mut self, source_name: &str) -> EngineResult<String> {
        if let Some(existing) = self.imported.get(source_name) {
            return Ok(existing.clone());
        }

        let secondary = self.secondary;
        let primary = self.primary;
        let data = secondary.part(source_name).ok_or_else(|| {
            EngineError::Resource(format!("secondary package has no part '{source_name}'"))
        })?;

        if source_name.starts_with(MEDIA_PREFIX) {
            if let Some(existing) = self.primary_media.get(&blake3::hash(data)) {
                let existing = existing.clone();
                self.imported.insert(source_name.to_string(), existing.clone());
                return Ok(existing);
            }
        }

        let final_name = match primary.part(source_name) {
            Some(existing) if existing == data => {
                self.imported
                    .insert(source_name.to_string(), source_name.to_string());
                return Ok(source_name.to_string());
            }
            Some(_) => self.unique_name(source_name),
            None if self.taken.contains(source_name) => self.unique_name(source_name),
            None => source_name.to_string(),
        };

        self.imported
            .insert(source_name.to_string(), final_name.clone());
        self.taken.insert(final_name.clone());
        self.additions.push((final_name.clone(), data.to_vec()));
        if final_name != source_name {
            self.renamed
                .push((source_name.to_string(), final_name.clone()));
        }

        self.import_dependencies(source_name, &final_name)?;
        Ok(final_name)
    }

    fn import_dependencies(&mut self, source_name: &str, final_name: &str) -> EngineResult<()> {
        let Some(relationships_xml) = self
            .secondary
            .part_text(&relationships_part_for(source_name))?
        else {
            return Ok(());
        };

        let base_dir = parent_dir(source_name).to_string();
        let mut rewritten = relationships_xml.clone();
        for definition in parse_relationships(&relationships_xml).values() {
            if definition.is_external() {
                continue;
            }
            let dependency = resolve_target(&base_dir, &definition.target);
            if !self.secondary.contains(&dependency) {
                tracing::warn!(
                    part = %source_name,
                    dependency = %dependency,
                    "secondary part references a missing dependency, leaving it as is"
                );
                continue;
            }

            let dependency_final = self.import(&dependency)?;
            if dependency_final != dependency {
                let old_target = xml_escape_attr(&definition.target);
                let new_target = xml_escape_attr(&retarget(&definition.target, &dependency_final));
                rewritten = rewritten.replace(
                    &format!("Target=\"{old_target}\""),
                    &format!("Target=\"{new_target}\""),
                );
            }
        }

        let relationships_name = relationships_part_for(final_name);
        self.taken.insert(relationships_name.clone());
        self.additions
            .push((relationships_name, rewritten.into_bytes()));
        Ok(())
    }

    /// Media the secondary carries that the primary lacks entirely, even if
    /// no spliced relationship points at it.
    fn import_remaining_media(&mut self) {
        let secondary = self.secondary;
        for entry in &secondary.entries {
            if !entry.name.starts_with(MEDIA_PREFIX)
                || self.imported.contains_key(&entry.name)
                || self.taken.contains(&entry.name)
            {
                continue;
            }
            self.imported
                .insert(entry.name.clone(), entry.name.clone());
            self.taken.insert(entry.name.clone());
            self.additions
                .push((entry.name.clone(), entry.data.clone()));
        }
    }
}

struct RelationshipPlan {
    remap: HashMap<String, String>,
    appended: Vec<(String, RelationshipDef)>,
}

/// Remap table for every relationship id the secondary body uses. Ids the
/// body never mentions are not planned, so declarations that exist only in
/// the secondary are dropped rather than appended.
fn plan_relationships(
    copier: &mut ResourceCopier<'_>,
    primary_relationships: &BTreeMap<String, RelationshipDef>,
    secondary_relationships: &BTreeMap<String, RelationshipDef>,
    referenced_ids: &BTreeSet<String>,
) -> EngineResult<RelationshipPlan> {
    let mut next_number = highest_relationship_number(primary_relationships.keys()) + 1;
    let mut remap = HashMap::new();
    let mut appended = Vec::<(String, RelationshipDef)>::new();

    for id in referenced_ids {
        let source_definition = secondary_relationships.get(id).ok_or_else(|| {
            EngineError::Resource(format!(
                "secondary body references relationship '{id}' which it does not declare"
            ))
        })?;

        let mut definition = source_definition.clone();
        if !definition.is_external() {
            let source_part = resolve_target("word", &definition.target);
            let final_part = copier.import(&source_part)?;
            if final_part != source_part {
                definition.target = match final_part.strip_prefix("word/") {
                    Some(relative) => relative.to_string(),
                    None => format!("/{final_part}"),
                };
            }
        }

        let reusable = primary_relationships
            .iter()
            .chain(appended.iter().map(|(id, definition)| (id, definition)))
            .find(|(_, existing)| **existing == definition)
            .map(|(existing_id, _)| existing_id.clone());
        if let Some(existing_id) = reusable {
            remap.insert(id.clone(), existing_id);
            continue;
        }

        let new_id = format!("rId{next_number}");
        next_number += 1;
        remap.insert(id.clone(), new_id.clone());
        appended.push((new_id, definition));
    }

    Ok(RelationshipPlan { remap, appended })
}

fn style_reference_regex() -> &'static Regex {
    static STYLE_REFERENCE: OnceLock<Regex> = OnceLock::new();
    STYLE_REFERENCE.get_or_init(|| {
        Regex::new(r#"<w:(?:pStyle|rStyle|tblStyle)\s+w:val\s*=\s*"([^"]+)""#)
            .expect("style reference regex is valid")
    })
}

pub(crate) fn referenced_style_ids(xml: &str) -> HashSet<String> {
    style_reference_regex()
        .captures_iter(xml)
        .filter_map(|captures| captures.get(1).map(|value| value.as_str().to_string()))
        .collect()
}

fn parse_source_style_definitions(styles_xml: &str) -> HashMap<String, SourceStyleDefinition> {
    let mut definitions = HashMap::new();
    let Ok(document) = Document::parse(styles_xml) else {
        return definitions;
    };

    for style in document
        .descendants()
        .filter(|node| has_tag(*node, "style"))
    {
        let Some(style_id) = attribute_value(style, "styleId") else {
            continue;
        };

        let range = style.range();
        if range.end > styles_xml.len() || range.start >= range.end {
            continue;
        }

        let dependencies = style
            .children()
            .filter(|node| has_tag(*node, "basedOn") || has_tag(*node, "next") || has_tag(*node, "link"))
            .filter_map(|node| attribute_value(node, "val"))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();

        definitions.insert(
            style_id.to_string(),
            SourceStyleDefinition {
                xml: styles_xml[range].to_string(),
                dependencies,
            },
        );
    }

    definitions
}

fn parse_style_ids(styles_xml: &str) -> HashSet<String> {
    let Ok(document) = Document::parse(styles_xml) else {
        return HashSet::new();
    };

    document
        .descendants()
        .filter(|node| has_tag(*node, "style"))
        .filter_map(|style| attribute_value(style, "styleId"))
        .filter(|style_id| !style_id.is_empty())
        .map(str::to_string)
        .collect()
}

fn collect_required_style_ids(
    requested_ids: &HashSet<String>,
    definitions: &HashMap<String, SourceStyleDefinition>,
) -> Vec<String> {
    fn visit(
        style_id: &str,
        definitions: &HashMap<String, SourceStyleDefinition>,
        seen: &mut HashSet<String>,
        ordered: &mut Vec<String>,
    ) {
        if !seen.insert(style_id.to_string()) {
            return;
        }

        if let Some(definition) = definitions.get(style_id) {
            for dependency in &definition.dependencies {
                visit(dependency, definitions, seen, ordered);
            }
            ordered.push(style_id.to_string());
        }
    }

    let mut requested = requested_ids.iter().collect::<Vec<&String>>();
    requested.sort();

    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for style_id in requested {
        visit(style_id, definitions, &mut seen, &mut ordered);
    }
    ordered
}

/// Appends secondary style definitions (and their `basedOn`/`next`/`link`
/// chain) that the primary's styles part lacks.
pub(crate) fn merge_missing_styles(
    target_styles_xml: &str,
    source_styles_xml: &str,
    requested_style_ids: &HashSet<String>,
) -> String {
    if requested_style_ids.is_empty() {
        return target_styles_xml.to_string();
    }

    let definitions = parse_source_style_definitions(source_styles_xml);
    let required_ids = collect_required_style_ids(requested_style_ids, &definitions);

    let mut existing_ids = parse_style_ids(target_styles_xml);
    let mut to_append = Vec::new();
    for style_id in required_ids {
        if existing_ids.contains(&style_id) {
            continue;
        }
        if let Some(definition) = definitions.get(&style_id) {
            to_append.push(definition.xml.as_str());
            existing_ids.insert(style_id);
        }
    }

    let Some(styles_close) = target_styles_xml.rfind("</w:styles>") else {
        return target_styles_xml.to_string();
    };
    if to_append.is_empty() {
        return target_styles_xml.to_string();
    }

    let mut updated = String::with_capacity(target_styles_xml.len() + to_append.concat().len());
    updated.push_str(&target_styles_xml[..styles_close]);
    for snippet in &to_append {
        updated.push_str(snippet);
    }
    updated.push_str(&target_styles_xml[styles_close..]);
    updated
}

struct ContentTypeEntries {
    defaults: HashMap<String, (String, String)>,
    overrides: HashMap<String, (String, String)>,
    default_order: Vec<String>,
    override_order: Vec<String>,
}

fn content_type_entries(content_types_xml: &str) -> EngineResult<ContentTypeEntries> {
    let document = Document::parse(content_types_xml)?;
    let mut entries = ContentTypeEntries {
        defaults: HashMap::new(),
        overrides: HashMap::new(),
        default_order: Vec::new(),
        override_order: Vec::new(),
    };

    for node in document.descendants().filter(|node| node.is_element()) {
        let verbatim = content_types_xml[node.range()].to_string();
        let content_type = attribute_value(node, "ContentType")
            .unwrap_or_default()
            .to_string();
        if has_tag(node, "Default") {
            if let Some(extension) = attribute_value(node, "Extension") {
                let key = extension.to_ascii_lowercase();
                entries.default_order.push(key.clone());
                entries.defaults.insert(key, (verbatim, content_type));
            }
        } else if has_tag(node, "Override") {
            if let Some(part_name) = attribute_value(node, "PartName") {
                let key = part_name.to_string();
                entries.override_order.push(key.clone());
                entries.overrides.insert(key, (verbatim, content_type));
            }
        }
    }

    Ok(entries)
}

/// Copies over, verbatim, every `Default`/`Override` of the secondary whose
/// key the primary does not declare, plus overrides for renamed parts.
pub(crate) fn merge_content_types(
    primary_xml: &str,
    secondary_xml: &str,
    renamed_parts: &[(String, String)],
) -> EngineResult<String> {
    let primary = content_type_entries(primary_xml)?;
    let secondary = content_type_entries(secondary_xml)?;

    let mut to_append = Vec::new();
    for key in &secondary.default_order {
        if primary.defaults.contains_key(key) {
            continue;
        }
        if let Some((verbatim, _)) = secondary.defaults.get(key) {
            to_append.push(verbatim.clone());
        }
    }
    let mut declared_overrides = primary.overrides.keys().cloned().collect::<HashSet<String>>();
    for key in &secondary.override_order {
        if !declared_overrides.insert(key.clone()) {
            continue;
        }
        if let Some((verbatim, _)) = secondary.overrides.get(key) {
            to_append.push(verbatim.clone());
        }
    }
    for (source_name, final_name) in renamed_parts {
        let Some((_, content_type)) = secondary.overrides.get(&format!("/{source_name}")) else {
            continue;
        };
        let part_name = format!("/{final_name}");
        if declared_overrides.insert(part_name.clone()) {
            to_append.push(format!(
                "<Override PartName=\"{}\" ContentType=\"{}\"/>",
                xml_escape_attr(&part_name),
                xml_escape_attr(content_type)
            ));
        }
    }

    if to_append.is_empty() {
        return Ok(primary_xml.to_string());
    }

    let close_index = primary_xml.rfind("</Types>").ok_or_else(|| {
        EngineError::Structure("[Content_Types].xml has no closing </Types> tag".to_string())
    })?;
    let mut updated = String::with_capacity(primary_xml.len() + to_append.concat().len());
    updated.push_str(&primary_xml[..close_index]);
    for snippet in &to_append {
        updated.push_str(snippet);
    }
    updated.push_str(&primary_xml[close_index..]);
    Ok(updated)
}

fn write_archive(
    base: &Package,
    replacements: &HashMap<String, Vec<u8>>,
    additions: &[(String, Vec<u8>)],
    method: CompressionMethod,
    level: Option<i64>,
) -> EngineResult<Vec<u8>> {
    let options = || {
        SimpleFileOptions::default()
            .compression_method(method)
            .compression_level(level)
    };
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut written = HashSet::new();

    for entry in &base.entries {
        writer.start_file(entry.name.as_str(), options())?;
        let data = replacements.get(&entry.name).unwrap_or(&entry.data);
        writer.write_all(data)?;
        written.insert(entry.name.as_str());
    }

    let mut pending_replacements = replacements
        .iter()
        .filter(|(name, _)| !written.contains(name.as_str()))
        .collect::<Vec<(&String, &Vec<u8>)>>();
    pending_replacements.sort_by(|left, right| left.0.cmp(right.0));
    for (name, data) in pending_replacements {
        writer.start_file(name.as_str(), options())?;
        writer.write_all(data)?;
    }

    for (name, data) in additions {
        if written.contains(name.as_str()) || replacements.contains_key(name) {
            continue;
        }
        writer.start_file(name.as_str(), options())?;
        writer.write_all(data)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// Deflate at the configured level, falling back to stored entries if
/// compression fails.
pub(crate) fn write_package(
    base: &Package,
    replacements: &HashMap<String, Vec<u8>>,
    additions: &[(String, Vec<u8>)],
    compression_level: i64,
) -> EngineResult<Vec<u8>> {
    let deflated = write_archive(
        base,
        replacements,
        additions,
        CompressionMethod::Deflated,
        Some(compression_level),
    );

    let bytes = match deflated {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(%error, "compressed package write failed, retrying uncompressed");
            write_archive(base, replacements, additions, CompressionMethod::Stored, None)?
        }
    };

    if !bytes.starts_with(ZIP_MAGIC) {
        return Err(EngineError::Package(
            "merged output is not a zip archive".to_string(),
        ));
    }
    Ok(bytes)
}

/// Merges `secondary` (static content) in front of `primary` (dynamic
/// content). Any structural or resource failure aborts the whole merge.
pub fn merge_packages(
    primary: &[u8],
    secondary: &[u8],
    config: &EngineConfig,
) -> EngineResult<MergedPackage> {
    let primary_package = Package::read(primary)?;
    let secondary_package = Package::read(secondary)?;

    let secondary_xml = secondary_package.required_text(DOCUMENT_PART)?;
    let primary_xml = merge_root_namespaces(
        &primary_package.required_text(DOCUMENT_PART)?,
        &secondary_xml,
    )?;

    let (primary_open, primary_close) = body_bounds(&primary_xml)?;
    let (secondary_open, secondary_close) = body_bounds(&secondary_xml)?;

    let (primary_body, trailing_sect_pr) =
        take_trailing_sect_pr(&primary_xml[primary_open..primary_close])?;
    let (secondary_body, stripped_sect_pr) =
        strip_sect_pr(&secondary_xml[secondary_open..secondary_close])?;

    let primary_relationships_xml = primary_package
        .part_text(DOCUMENT_RELS_PART)?
        .unwrap_or_else(|| EMPTY_RELATIONSHIPS_XML.to_string());
    let secondary_relationships_xml = secondary_package
        .part_text(DOCUMENT_RELS_PART)?
        .unwrap_or_else(|| EMPTY_RELATIONSHIPS_XML.to_string());
    let primary_relationships = parse_relationships(&primary_relationships_xml);
    let secondary_relationships = parse_relationships(&secondary_relationships_xml);

    let mut copier = ResourceCopier::new(&primary_package, &secondary_package);
    let plan = plan_relationships(
        &mut copier,
        &primary_relationships,
        &secondary_relationships,
        &referenced_relationship_ids(&secondary_body),
    )?;
    copier.import_remaining_media();
    let secondary_body = remap_relationship_ids(&secondary_body, &plan.remap);

    let mut merged_xml = String::with_capacity(primary_xml.len() + secondary_body.len());
    merged_xml.push_str(&primary_xml[..primary_open]);
    merged_xml.push_str(&secondary_body);
    merged_xml.push_str(&primary_body);
    if let Some(sect_pr) = &trailing_sect_pr {
        merged_xml.push_str(sect_pr);
    }
    merged_xml.push_str(&primary_xml[primary_close..]);

    let paragraph_count = validate_merged_document(&merged_xml)?;

    let mut replacements = HashMap::new();
    if !plan.appended.is_empty() {
        replacements.insert(
            DOCUMENT_RELS_PART.to_string(),
            append_relationships(&primary_relationships_xml, &plan.appended)?.into_bytes(),
        );
    }

    let style_ids = referenced_style_ids(&secondary_body);
    if let (Some(primary_styles), Some(secondary_styles)) = (
        primary_package.part_text(STYLES_PART)?,
        secondary_package.part_text(STYLES_PART)?,
    ) {
        replacements.insert(
            STYLES_PART.to_string(),
            merge_missing_styles(&primary_styles, &secondary_styles, &style_ids).into_bytes(),
        );
    }

    if let Some(primary_content_types) = primary_package.part_text(CONTENT_TYPES_PART)? {
        let merged_content_types = match secondary_package.part_text(CONTENT_TYPES_PART)? {
            Some(secondary_content_types) => merge_content_types(
                &primary_content_types,
                &secondary_content_types,
                &copier.renamed,
            )?,
            None => primary_content_types,
        };
        replacements.insert(CONTENT_TYPES_PART.to_string(), merged_content_types.into_bytes());
    }

    replacements.insert(DOCUMENT_PART.to_string(), merged_xml.into_bytes());

    let media_copied = copier
        .additions
        .iter()
        .filter(|(name, _)| name.starts_with(MEDIA_PREFIX))
        .count();
    let bytes = write_package(
        &primary_package,
        &replacements,
        &copier.additions,
        config.compression_level,
    )?;

    tracing::info!(
        paragraph_count,
        relationships_added = plan.appended.len(),
        media_copied,
        stripped_sect_pr,
        kept_trailing_sect_pr = trailing_sect_pr.is_some(),
        "merged document packages"
    );

    Ok(MergedPackage {
        bytes,
        paragraph_count,
        relationships_added: plan.appended.len(),
        media_copied,
    })
}
