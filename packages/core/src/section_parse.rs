//! Heuristic section detection over linearized document content.
//!
//! A line opens a new section when it carries an enumerator followed by a
//! capitalized word (`12. Title`, `IV. Title`, `A) Title`), when it is a
//! short all-caps line, or when it carries a classification marker such as
//! `[ESTÁTICO]`. Everything else is body text of the section in progress.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::EngineConfig;
use crate::types::{ContentNode, NodeKind, Section, SectionKind};

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?i)\[(EST[AÁ]TICO|DIN[AÁ]MICO)\]|\((EST[AÁ]TICO|DIN[AÁ]MICO)\)")
            .expect("marker regex is valid")
    })
}

fn decimal_regex() -> &'static Regex {
    static DECIMAL: OnceLock<Regex> = OnceLock::new();
    DECIMAL.get_or_init(|| {
        Regex::new(r"^\s*(\d{1,3})\s*[.)\-:]\s+(\S.*)$").expect("decimal regex is valid")
    })
}

fn roman_regex() -> &'static Regex {
    static ROMAN: OnceLock<Regex> = OnceLock::new();
    ROMAN.get_or_init(|| {
        Regex::new(r"^\s*([IVXLCDM]{1,7})[.)]\s+(\S.*)$").expect("roman regex is valid")
    })
}

fn lettered_regex() -> &'static Regex {
    static LETTERED: OnceLock<Regex> = OnceLock::new();
    LETTERED.get_or_init(|| {
        Regex::new(r"^\s*([A-Z])[.)]\s+(\S.*)$").expect("lettered regex is valid")
    })
}

fn loose_regex() -> &'static Regex {
    static LOOSE: OnceLock<Regex> = OnceLock::new();
    LOOSE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)[\s.)\-:_]*(.*)$").expect("loose title regex is valid")
    })
}

fn trailing_artifact_regex() -> &'static Regex {
    static TRAILING: OnceLock<Regex> = OnceLock::new();
    TRAILING.get_or_init(|| {
        Regex::new(r"(?:\t.*|\s*\.{2,}\s*\d*|\s{2,}\d{1,4})\s*$")
            .expect("trailing artifact regex is valid")
    })
}

/// Classification requested by markers in `text`. A line carrying both kinds
/// resolves to dynamic.
pub fn marker_kind(text: &str) -> Option<SectionKind> {
    let mut found = None;
    for captures in marker_regex().captures_iter(text) {
        let word = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|value| value.as_str())
            .unwrap_or_default();
        if word.to_lowercase().starts_with("din") {
            return Some(SectionKind::Dynamic);
        }
        found = Some(SectionKind::Static);
    }
    found
}

pub fn strip_markers(text: &str) -> String {
    marker_regex().replace_all(text, "").into_owned()
}

fn starts_capitalized(text: &str) -> bool {
    text.chars()
        .next()
        .map(|first| first.is_uppercase() || matches!(first, '¿' | '¡' | '"' | '“' | '«'))
        .unwrap_or(false)
}

fn is_numeric(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|character| character.is_ascii_digit())
}

/// Leading enumerator of a title line: its order and the text after it.
fn match_enumerator(line: &str) -> Option<(i64, &str)> {
    if let Some(captures) = roman_regex().captures(line) {
        let numeral = captures.get(1)?.as_str();
        let rest = captures.get(2)?.as_str();
        // Lone C, D, L and M read as letters (`C) Costos`), not 100/500/50/1000.
        let reads_as_roman = numeral.len() > 1 || matches!(numeral, "I" | "V" | "X");
        if reads_as_roman && starts_capitalized(rest) {
            if let Some(value) = crate::util::roman_value(numeral) {
                return Some((value, rest));
            }
        }
    }

    if let Some(captures) = lettered_regex().captures(line) {
        let letter = captures.get(1)?.as_str().chars().next()?;
        let rest = captures.get(2)?.as_str();
        if starts_capitalized(rest) {
            let order = i64::from(u32::from(letter) - u32::from('A') + 1);
            return Some((order, rest));
        }
    }

    let captures = decimal_regex().captures(line)?;
    let rest = captures.get(2)?.as_str();
    if !starts_capitalized(rest) {
        return None;
    }
    let order = captures.get(1)?.as_str().parse::<i64>().ok()?;
    Some((order, rest))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn clean_title(raw: &str) -> String {
    let without_markers = strip_markers(raw);
    let without_artifacts = trailing_artifact_regex().replace(&without_markers, "");
    collapse_whitespace(&without_artifacts)
        .trim_end_matches([':', '-', '–', '.'])
        .trim()
        .to_string()
}

/// Longest prefix before any bracket or trailing number, re-cleaned.
fn fallback_title(raw: &str) -> String {
    let prefix = raw
        .split(['[', '('])
        .next()
        .unwrap_or_default()
        .trim_end_matches(|character: char| character.is_ascii_digit() || character.is_whitespace());
    clean_title(prefix)
}

fn derive_title(raw: &str, order: i64) -> String {
    let title = clean_title(raw);
    if !title.is_empty() && !is_numeric(&title) {
        return title;
    }

    let fallback = fallback_title(raw);
    if !fallback.is_empty() && !is_numeric(&fallback) {
        return fallback;
    }

    format!("Sección {order}")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TitleRule {
    Primary,
    Loose,
}

struct TitleMatch {
    order: Option<i64>,
    raw_title: String,
    marker: Option<SectionKind>,
}

struct PendingSection {
    order: i64,
    title: String,
    marker: Option<SectionKind>,
    start_index: Option<usize>,
    lines: Vec<String>,
}

impl PendingSection {
    fn into_section(self) -> Section {
        let mut section = Section::new(self.order, self.title, join_body(&self.lines));
        if let Some(kind) = self.marker {
            section.set_kind(kind);
        }
        section.marker = self.marker;
        section.start_index = self.start_index;
        section
    }
}

fn join_body(lines: &[String]) -> String {
    lines.join("\n").trim().to_string()
}

pub struct SectionParser<'a> {
    config: &'a EngineConfig,
}

impl<'a> SectionParser<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn parse_text(&self, text: &str) -> Vec<Section> {
        let lines = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect::<Vec<&str>>();
        self.parse_lines(&lines)
    }

    pub fn parse_lines<S: AsRef<str>>(&self, lines: &[S]) -> Vec<Section> {
        let nodes = lines
            .iter()
            .map(|line| ContentNode::line(line.as_ref()))
            .collect::<Vec<ContentNode>>();
        self.parse_nodes(&nodes)
    }

    /// Splits `nodes` into sections. Retries with the loose digit rule when
    /// the canonical patterns find no title at all.
    pub fn parse_nodes(&self, nodes: &[ContentNode]) -> Vec<Section> {
        let (sections, titled) = self.scan(nodes, TitleRule::Primary);
        if titled > 0 {
            return sections;
        }

        let (loose_sections, loose_titled) = self.scan(nodes, TitleRule::Loose);
        if loose_titled > 0 {
            tracing::debug!(
                sections = loose_sections.len(),
                "no canonical section titles found, used loose numbering rule"
            );
            return loose_sections;
        }

        sections
    }

    fn scan(&self, nodes: &[ContentNode], rule: TitleRule) -> (Vec<Section>, usize) {
        let mut sections = Vec::new();
        let mut intro_lines = Vec::<String>::new();
        let mut current: Option<PendingSection> = None;
        let mut previous_order = 0_i64;
        let mut titled = 0_usize;

        for node in nodes {
            let text = node.text.trim_end_matches(['\n', '\r']);

            let title_match = match node.kind {
                NodeKind::Paragraph => self.match_title(text, rule),
                NodeKind::Table => None,
            };

            if let Some(title_match) = title_match {
                if let Some(pending) = current.take() {
                    sections.push(pending.into_section());
                } else if !join_body(&intro_lines).is_empty() {
                    sections.push(Section::new(
                        0,
                        self.config.intro_title.clone(),
                        join_body(&intro_lines),
                    ));
                    intro_lines.clear();
                }

                let order = title_match.order.unwrap_or(previous_order + 1);
                previous_order = order;
                titled += 1;
                current = Some(PendingSection {
                    order,
                    title: derive_title(&title_match.raw_title, order),
                    marker: title_match.marker,
                    start_index: node.start_index,
                    lines: Vec::new(),
                });
                continue;
            }

            let had_marker = marker_regex().is_match(text);
            let cleaned = strip_markers(text).trim_end().to_string();
            if had_marker && cleaned.trim().is_empty() {
                continue;
            }

            match current.as_mut() {
                Some(pending) => pending.lines.push(cleaned),
                None => intro_lines.push(cleaned),
            }
        }

        if let Some(pending) = current.take() {
            sections.push(pending.into_section());
        } else if !join_body(&intro_lines).is_empty() {
            sections.push(Section::new(
                0,
                self.config.intro_title.clone(),
                join_body(&intro_lines),
            ));
        }

        (sections, titled)
    }

    fn match_title(&self, line: &str, rule: TitleRule) -> Option<TitleMatch> {
        let marker = marker_kind(line);
        let stripped = strip_markers(line);
        let trimmed = stripped.trim();

        if marker.is_none() && (trimmed.is_empty() || is_numeric(trimmed)) {
            return None;
        }

        if rule == TitleRule::Loose {
            return self.match_loose_title(trimmed, marker);
        }

        if let Some((order, rest)) = match_enumerator(trimmed) {
            if marker.is_some() || clean_title(rest).chars().count() >= self.config.min_title_chars
            {
                return Some(TitleMatch {
                    order: Some(order),
                    raw_title: rest.to_string(),
                    marker,
                });
            }
            return None;
        }

        if self.is_caps_title(trimmed) {
            return Some(TitleMatch {
                order: None,
                raw_title: trimmed.to_string(),
                marker,
            });
        }

        marker.map(|marker| TitleMatch {
            order: None,
            raw_title: trimmed.to_string(),
            marker: Some(marker),
        })
    }

    fn match_loose_title(&self, trimmed: &str, marker: Option<SectionKind>) -> Option<TitleMatch> {
        if trimmed.chars().count() <= 2 {
            return None;
        }
        let captures = loose_regex().captures(trimmed)?;
        let order = captures.get(1)?.as_str().parse::<i64>().ok()?;
        let rest = captures.get(2).map(|value| value.as_str()).unwrap_or_default();
        Some(TitleMatch {
            order: Some(order),
            raw_title: rest.to_string(),
            marker,
        })
    }

    fn is_caps_title(&self, trimmed: &str) -> bool {
        let length = trimmed.chars().count();
        if length >= self.config.max_caps_title_chars {
            return false;
        }
        if clean_title(trimmed).chars().count() < self.config.min_title_chars {
            return false;
        }

        let mut letters = 0_usize;
        for character in trimmed.chars().filter(|character| character.is_alphabetic()) {
            if character.is_lowercase() {
                return false;
            }
            letters += 1;
        }
        letters >= 2
    }
}

pub fn parse_sections(text: &str, config: &EngineConfig) -> Vec<Section> {
    SectionParser::new(config).parse_text(text)
}

#[cfg(test)]
mod tests {
    use super::{marker_kind, parse_sections, strip_markers, SectionParser};
    use crate::config::EngineConfig;
    use crate::types::{ContentNode, NodeKind, SectionKind};

    #[test]
    fn parses_enumerated_sections_with_markers() {
        let config = EngineConfig::default();
        let sections = parse_sections(
            "1. Intro\nhello\n2. Plan [DINÁMICO]\nold\n3. Costs\nfixed",
            &config,
        );

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].order, 1);
        assert_eq!(sections[0].title, "Intro");
        assert_eq!(sections[0].content, "hello");
        assert_eq!(sections[0].marker, None);

        assert_eq!(sections[1].order, 2);
        assert_eq!(sections[1].title, "Plan");
        assert_eq!(sections[1].content, "old");
        assert!(sections[1].is_dynamic);
        assert_eq!(sections[1].marker, Some(SectionKind::Dynamic));

        assert_eq!(sections[2].order, 3);
        assert_eq!(sections[2].title, "Costs");
        assert_eq!(sections[2].content, "fixed");
    }

    #[test]
    fn markers_classify_regardless_of_enumerator_style() {
        let config = EngineConfig::default();
        let sections = parse_sections(
            "IV. Garantías (estático)\ntexto\nB) Alcance [ESTATICO]\nmás\nRESUMEN EJECUTIVO [Dinámico]\nresumen",
            &config,
        );

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].order, 4);
        assert_eq!(sections[0].title, "Garantías");
        assert!(sections[0].is_static);
        assert!(!sections[0].is_dynamic);

        assert_eq!(sections[1].order, 2);
        assert_eq!(sections[1].title, "Alcance");
        assert!(sections[1].is_static);

        assert_eq!(sections[2].order, 3);
        assert_eq!(sections[2].title, "RESUMEN EJECUTIVO");
        assert!(sections[2].is_dynamic);
    }

    #[test]
    fn leading_text_becomes_introduction() {
        let config = EngineConfig::default();
        let sections = parse_sections("Propuesta para ACME\n\n1. Alcance\ndetalle", &config);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].order, 0);
        assert_eq!(sections[0].title, "Introducción");
        assert_eq!(sections[0].content, "Propuesta para ACME");
        assert_eq!(sections[1].order, 1);
    }

    #[test]
    fn stray_page_numbers_stay_in_the_body() {
        let config = EngineConfig::default();
        let sections = parse_sections("1. Alcance\ntexto\n12\nmás texto", &config);

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].content, "texto\n12\nmás texto");
    }

    #[test]
    fn strips_tab_page_numbers_and_dot_leaders_from_titles() {
        let config = EngineConfig::default();
        let sections = parse_sections("2. Arquitectura\t14\nx\n3. Costos........ 21\ny", &config);

        assert_eq!(sections[0].title, "Arquitectura");
        assert_eq!(sections[1].title, "Costos");
    }

    #[test]
    fn subsection_numbering_is_body_text() {
        let config = EngineConfig::default();
        let sections = parse_sections("3. Detalle\n3.1 Primera parte\ntexto", &config);

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].content, "3.1 Primera parte\ntexto");
    }

    #[test]
    fn marker_alone_forces_a_section_break() {
        let config = EngineConfig::default();
        let sections = parse_sections("Texto previo\n1. Alcance\nx\n[DINÁMICO]\ncontenido", &config);

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[2].order, 2);
        assert_eq!(sections[2].title, "Sección 2");
        assert_eq!(sections[2].content, "contenido");
        assert_eq!(sections[2].marker, Some(SectionKind::Dynamic));
    }

    #[test]
    fn falls_back_to_loose_digit_titles() {
        let config = EngineConfig::default();
        let sections = parse_sections("1-intro\nhola\n2-plan\nadios", &config);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].order, 1);
        assert_eq!(sections[0].title, "intro");
        assert_eq!(sections[0].content, "hola");
        assert_eq!(sections[1].order, 2);
        assert_eq!(sections[1].title, "plan");
    }

    #[test]
    fn bare_numbers_without_delimiter_stay_in_the_body() {
        let config = EngineConfig::default();
        let sections = parse_sections(
            "2. Equipo\n5 Consultores senior asignados\n3. Costos\nfijo",
            &config,
        );

        let orders = sections.iter().map(|section| section.order).collect::<Vec<i64>>();
        assert_eq!(orders, vec![2, 3]);
        assert_eq!(sections[0].title, "Equipo");
        assert_eq!(sections[0].content, "5 Consultores senior asignados");
        assert_eq!(sections[1].content, "fijo");
    }

    #[test]
    fn records_title_offsets_from_structured_nodes() {
        let config = EngineConfig::default();
        let nodes = vec![
            ContentNode {
                kind: NodeKind::Paragraph,
                text: "1. Intro\n".to_string(),
                start_index: Some(1),
                end_index: Some(10),
            },
            ContentNode {
                kind: NodeKind::Table,
                text: "celda [ESTÁTICO] uno".to_string(),
                start_index: Some(10),
                end_index: Some(30),
            },
            ContentNode {
                kind: NodeKind::Paragraph,
                text: "2. Plan\n".to_string(),
                start_index: Some(30),
                end_index: Some(38),
            },
        ];

        let sections = SectionParser::new(&config).parse_nodes(&nodes);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].start_index, Some(1));
        assert_eq!(sections[0].content, "celda  uno");
        assert_eq!(sections[1].start_index, Some(30));
    }

    #[test]
    fn marker_helpers_cover_all_spellings() {
        for marker in ["[ESTÁTICO]", "[ESTATICO]", "(ESTÁTICO)", "(estatico)"] {
            assert_eq!(marker_kind(marker), Some(SectionKind::Static), "{marker}");
        }
        for marker in ["[DINÁMICO]", "[DINAMICO]", "(DINÁMICO)", "(dinamico)"] {
            assert_eq!(marker_kind(marker), Some(SectionKind::Dynamic), "{marker}");
        }
        assert_eq!(marker_kind("[ESTÁTICO) suelto"), None);
        assert_eq!(strip_markers("Plan [DINÁMICO] final"), "Plan  final");
    }
}
