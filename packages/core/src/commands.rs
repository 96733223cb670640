use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::classify::resolve_classification;
use crate::compose::{self, GeneratedDocument, Skeleton};
use crate::config::EngineConfig;
use crate::docx_merge::{self, MergedPackage};
use crate::docx_parse;
use crate::order_merge::{merge_by_order, merge_with_empty_dynamic, OrderMerge};
use crate::preview;
use crate::section_parse;
use crate::types::{ExtractedDocument, Section, TemplateSection};
use crate::util::{path_display, write_file_replacing};

pub type CommandResult<T> = Result<T, String>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePackagesResult {
    pub output_path: String,
    #[serde(flatten)]
    pub merge: MergedPackage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateProposalResult {
    pub output_path: String,
    #[serde(flatten)]
    pub document: GeneratedDocument,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSkeletonResult {
    pub output_path: String,
    #[serde(flatten)]
    pub skeleton: Skeleton,
}

fn read_package(path: &str) -> CommandResult<Vec<u8>> {
    let path = Path::new(path);
    if !path.is_file() {
        return Err(format!("Document not found: {}", path_display(path)));
    }
    fs::read(path).map_err(|error| format!("Could not read '{}': {error}", path_display(path)))
}

fn write_output(path: &str, bytes: &[u8]) -> CommandResult<()> {
    let path = Path::new(path);
    write_file_replacing(path, bytes)
        .map_err(|error| format!("Could not write '{}': {error}", path_display(path)))
}

pub fn parse_sections(
    config: &EngineConfig,
    text: String,
    declarations: Option<Vec<TemplateSection>>,
) -> CommandResult<Vec<Section>> {
    let sections = section_parse::parse_sections(&text, config);
    Ok(resolve_classification(sections, declarations.as_deref()))
}

pub fn parse_package_sections(
    config: &EngineConfig,
    path: String,
    declarations: Option<Vec<TemplateSection>>,
) -> CommandResult<Vec<Section>> {
    let bytes = read_package(&path)?;
    let sections =
        docx_parse::parse_package_sections(&bytes, config).map_err(|error| error.to_string())?;
    Ok(resolve_classification(sections, declarations.as_deref()))
}

pub fn merge_sections(
    static_sections: Vec<Section>,
    dynamic_sections: Vec<Section>,
    empty_dynamic: Option<bool>,
    declarations: Option<Vec<TemplateSection>>,
) -> CommandResult<OrderMerge> {
    if empty_dynamic.unwrap_or(false) {
        return Ok(merge_with_empty_dynamic(
            static_sections,
            dynamic_sections,
            declarations.as_deref(),
        ));
    }

    match declarations.as_deref() {
        Some(declarations) => Ok(merge_by_order(
            resolve_classification(static_sections, Some(declarations)),
            resolve_classification(dynamic_sections, Some(declarations)),
        )),
        None => Ok(merge_by_order(static_sections, dynamic_sections)),
    }
}

pub fn merge_packages(
    config: &EngineConfig,
    primary_path: String,
    secondary_path: String,
    output_path: String,
) -> CommandResult<MergePackagesResult> {
    let primary = read_package(&primary_path)?;
    let secondary = read_package(&secondary_path)?;

    let merge = docx_merge::merge_packages(&primary, &secondary, config)
        .map_err(|error| error.to_string())?;
    write_output(&output_path, &merge.bytes)?;

    Ok(MergePackagesResult { output_path, merge })
}

pub fn generate_proposal(
    config: &EngineConfig,
    dynamic_path: String,
    static_path: String,
    output_path: String,
    declarations: Option<Vec<TemplateSection>>,
) -> CommandResult<GenerateProposalResult> {
    let dynamic_package = read_package(&dynamic_path)?;
    let static_package = read_package(&static_path)?;

    let document = compose::generate_proposal(
        &dynamic_package,
        &static_package,
        declarations.as_deref(),
        config,
    )
    .map_err(|error| error.to_string())?;
    write_output(&output_path, &document.bytes)?;

    Ok(GenerateProposalResult {
        output_path,
        document,
    })
}

pub fn build_skeleton(
    config: &EngineConfig,
    static_text: String,
    dynamic_text: String,
    output_path: String,
    declarations: Option<Vec<TemplateSection>>,
) -> CommandResult<BuildSkeletonResult> {
    let skeleton = compose::build_skeleton(
        &static_text,
        &dynamic_text,
        declarations.as_deref(),
        config,
    )
    .map_err(|error| error.to_string())?;
    write_output(&output_path, &skeleton.bytes)?;

    Ok(BuildSkeletonResult {
        output_path,
        skeleton,
    })
}

pub fn extract_document(path: String) -> CommandResult<ExtractedDocument> {
    let bytes = read_package(&path)?;
    preview::extract_document(&bytes).map_err(|error| error.to_string())
}
