use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::{OnceLock, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod classify;
mod commands;
mod compose;
mod config;
mod docx_build;
mod docx_merge;
mod docx_parse;
mod error;
mod live_doc;
mod live_update;
mod order_merge;
mod preview;
mod section_parse;
mod types;
mod util;

pub use classify::resolve_classification;
pub use commands::CommandResult;
pub use compose::{
    build_skeleton, generate_proposal, merge_package_pairs, GeneratedDocument, GenerationStrategy,
    Skeleton,
};
pub use config::EngineConfig;
pub use docx_build::build_simplified_document;
pub use docx_merge::{merge_packages, MergedPackage};
pub use docx_parse::{package_nodes, parse_package_sections};
pub use error::{EngineError, EngineResult};
pub use live_doc::{
    structural_nodes, DocumentApi, EditOp, InMemoryDocuments, StructuralElement,
    StructuredDocument,
};
pub use live_update::{
    update_sections_serialized, DocumentLocks, SectionUpdate, SectionUpdater, SkippedUpdate,
    UpdateReport,
};
pub use order_merge::{merge_by_order, merge_with_empty_dynamic, OrderMerge};
pub use preview::extract_document;
pub use section_parse::{marker_kind, parse_sections, strip_markers, SectionParser};
pub use types::{
    ContentNode, ExtractedDocument, MergedSection, NodeKind, OrderConflict, Section, SectionKind,
    SectionSource, TemplateSection,
};

static ENGINE_CONFIG: OnceLock<RwLock<EngineConfig>> = OnceLock::new();

fn config_cell() -> &'static RwLock<EngineConfig> {
    ENGINE_CONFIG.get_or_init(|| RwLock::new(EngineConfig::default()))
}

fn current_config() -> CommandResult<EngineConfig> {
    config_cell()
        .read()
        .map(|config| config.clone())
        .map_err(|_| "Could not read engine configuration".to_string())
}

fn set_config(config: EngineConfig) -> CommandResult<()> {
    let mut writer = config_cell()
        .write()
        .map_err(|_| "Could not update engine configuration".to_string())?;
    *writer = config;
    Ok(())
}

/// Installs the global `tracing` subscriber. `filter` takes `EnvFilter`
/// directives; without it `RUST_LOG` is used, then `info`. Returns false
/// when the host already installed a subscriber.
pub fn init_logging(filter: Option<&str>) -> bool {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[derive(Deserialize)]
struct InvokeRequest {
    command: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParseSectionsArgs {
    text: String,
    declarations: Option<Vec<TemplateSection>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsePackageSectionsArgs {
    path: String,
    declarations: Option<Vec<TemplateSection>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeSectionsArgs {
    static_sections: Vec<Section>,
    dynamic_sections: Vec<Section>,
    empty_dynamic: Option<bool>,
    declarations: Option<Vec<TemplateSection>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergePackagesArgs {
    primary_path: String,
    secondary_path: String,
    output_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateProposalArgs {
    dynamic_path: String,
    static_path: String,
    output_path: String,
    declarations: Option<Vec<TemplateSection>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildSkeletonArgs {
    static_text: String,
    dynamic_text: String,
    output_path: String,
    declarations: Option<Vec<TemplateSection>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractDocumentArgs {
    path: String,
}

fn parse_args<T: DeserializeOwned>(value: Value) -> CommandResult<T> {
    serde_json::from_value(value).map_err(|error| format!("Could not parse command args: {error}"))
}

fn to_json_value<T: Serialize>(value: T) -> CommandResult<Value> {
    serde_json::to_value(value).map_err(|error| format!("Could not serialize command result: {error}"))
}

fn invoke_command(request: InvokeRequest) -> CommandResult<Value> {
    let config = current_config()?;
    let InvokeRequest { command, args } = request;
    tracing::debug!(command = %command, "invoking core command");

    match command.as_str() {
        "parse_sections" => {
            let args: ParseSectionsArgs = parse_args(args)?;
            to_json_value(commands::parse_sections(&config, args.text, args.declarations)?)
        }
        "parse_package_sections" => {
            let args: ParsePackageSectionsArgs = parse_args(args)?;
            to_json_value(commands::parse_package_sections(
                &config,
                args.path,
                args.declarations,
            )?)
        }
        "merge_sections" => {
            let args: MergeSectionsArgs = parse_args(args)?;
            to_json_value(commands::merge_sections(
                args.static_sections,
                args.dynamic_sections,
                args.empty_dynamic,
                args.declarations,
            )?)
        }
        "merge_packages" => {
            let args: MergePackagesArgs = parse_args(args)?;
            to_json_value(commands::merge_packages(
                &config,
                args.primary_path,
                args.secondary_path,
                args.output_path,
            )?)
        }
        "generate_proposal" => {
            let args: GenerateProposalArgs = parse_args(args)?;
            to_json_value(commands::generate_proposal(
                &config,
                args.dynamic_path,
                args.static_path,
                args.output_path,
                args.declarations,
            )?)
        }
        "build_skeleton" => {
            let args: BuildSkeletonArgs = parse_args(args)?;
            to_json_value(commands::build_skeleton(
                &config,
                args.static_text,
                args.dynamic_text,
                args.output_path,
                args.declarations,
            )?)
        }
        "extract_document" => {
            let args: ExtractDocumentArgs = parse_args(args)?;
            to_json_value(commands::extract_document(args.path)?)
        }
        _ => Err(format!("Unknown command: {command}")),
    }
}

fn response_json_pointer(response: InvokeResponse) -> *mut c_char {
    let raw = serde_json::to_string(&response).unwrap_or_else(|error| {
        format!("{{\"ok\":false,\"error\":\"Could not serialize response: {error}\"}}")
    });

    CString::new(raw)
        .unwrap_or_else(|_| {
            CString::new("{\"ok\":false,\"error\":\"Response contains null byte\"}")
                .expect("fallback JSON string is valid")
        })
        .into_raw()
}

unsafe fn pointer_to_string(ptr: *const c_char) -> CommandResult<String> {
    if ptr.is_null() {
        return Err("Received null pointer".to_string());
    }

    CStr::from_ptr(ptr)
        .to_str()
        .map(|value| value.to_string())
        .map_err(|error| format!("Could not decode UTF-8 string: {error}"))
}

fn configure_from_json(raw: Option<&str>) -> CommandResult<()> {
    let config = match raw {
        Some(raw) => EngineConfig::from_json(raw).map_err(|error| error.to_string())?,
        None => EngineConfig::default(),
    };
    init_logging(config.log_filter.as_deref());
    set_config(config)
}

/// Accepts an `EngineConfig` JSON object, or null for defaults. Returns 1 on
/// success and 0 when the configuration is rejected.
#[no_mangle]
pub extern "C" fn core_configure(config_json_ptr: *const c_char) -> c_int {
    let raw = if config_json_ptr.is_null() {
        None
    } else {
        match unsafe { pointer_to_string(config_json_ptr) } {
            Ok(raw) => Some(raw),
            Err(_) => return 0,
        }
    };

    match configure_from_json(raw.as_deref()) {
        Ok(()) => 1,
        Err(error) => {
            tracing::warn!(%error, "rejected engine configuration");
            0
        }
    }
}

#[no_mangle]
pub extern "C" fn core_invoke_json(request_ptr: *const c_char) -> *mut c_char {
    let response = match unsafe { pointer_to_string(request_ptr) }
        .and_then(|raw| serde_json::from_str::<InvokeRequest>(&raw).map_err(|error| error.to_string()))
        .and_then(invoke_command)
    {
        Ok(value) => InvokeResponse {
            ok: true,
            value: Some(value),
            error: None,
        },
        Err(error) => InvokeResponse {
            ok: false,
            value: None,
            error: Some(error),
        },
    };

    response_json_pointer(response)
}

#[no_mangle]
pub extern "C" fn core_free_str(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(s));
    }
}
