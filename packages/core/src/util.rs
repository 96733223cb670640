use std::fs;
use std::path::Path;

use crate::error::EngineResult;

pub(crate) fn path_display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Lowercases, drops accents on the common Spanish vowels and collapses
/// every run of non-alphanumerics into one space. Used to compare titles
/// that went through different editors.
pub(crate) fn normalize_title(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut previous_space = false;
    for character in text.chars() {
        if character.is_alphanumeric() {
            previous_space = false;
            for lower in character.to_lowercase() {
                normalized.push(strip_accent(lower));
            }
        } else if !previous_space {
            normalized.push(' ');
            previous_space = true;
        }
    }
    normalized.trim().to_string()
}

fn strip_accent(character: char) -> char {
    match character {
        'á' | 'à' | 'ä' => 'a',
        'é' | 'è' | 'ë' => 'e',
        'í' | 'ì' | 'ï' => 'i',
        'ó' | 'ò' | 'ö' => 'o',
        'ú' | 'ù' | 'ü' => 'u',
        other => other,
    }
}

pub(crate) fn xml_escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn xml_escape_attr(value: &str) -> String {
    xml_escape_text(value)
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub(crate) fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub(crate) fn roman_value(numeral: &str) -> Option<i64> {
    let mut total = 0_i64;
    let mut previous = 0_i64;
    for character in numeral.chars().rev() {
        let value = match character.to_ascii_uppercase() {
            'I' => 1,
            'V' => 5,
            'X' => 10,
            'L' => 50,
            'C' => 100,
            'D' => 500,
            'M' => 1000,
            _ => return None,
        };
        if value < previous {
            total -= value;
        } else {
            total += value;
            previous = value;
        }
    }
    (total > 0).then_some(total)
}

/// Writes through a temporary sibling so readers never observe a
/// half-written package.
pub(crate) fn write_file_replacing(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("docx.tmp");
    fs::write(&temp_path, bytes)?;

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            if path.exists() {
                fs::remove_file(path)?;
            }
            fs::rename(&temp_path, path)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_title, roman_value, xml_escape_attr};

    #[test]
    fn normalize_title_ignores_case_accents_and_punctuation() {
        assert_eq!(normalize_title("  Arquitectura: Técnica!! "), "arquitectura tecnica");
        assert_eq!(normalize_title("ARQUITECTURA TECNICA"), "arquitectura tecnica");
    }

    #[test]
    fn roman_value_handles_subtractive_pairs() {
        assert_eq!(roman_value("IV"), Some(4));
        assert_eq!(roman_value("XII"), Some(12));
        assert_eq!(roman_value("MCMXC"), Some(1990));
        assert_eq!(roman_value("IZ"), None);
    }

    #[test]
    fn xml_escape_attr_escapes_quotes() {
        assert_eq!(xml_escape_attr("a\"b'<c>"), "a&quot;b&apos;&lt;c&gt;");
    }
}
