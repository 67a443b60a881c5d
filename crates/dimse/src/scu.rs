//! Service Class User (SCU) implementation backed by the DCMTK command line tools

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::DimseConfig;
use crate::network::DimseNetwork;
use crate::types::{DimseOperation, DimseRequest, OperationResult, ResultCode};
use crate::{DimseError, Result};

/// Directory under the storage root where received instances land before relocation
pub const INCOMING_DIR: &str = ".incoming";

/// Exit code reported when a tool was terminated by a signal
const SIGNALLED_EXIT: i64 = -1;

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    #[cfg(feature = "dcmtk_cli")]
    async fn run_tool(&self, program: &str, args: &[String], bounded: bool) -> Result<Output> {
        use tokio::process::Command;

        debug!("Running: {} {}", program, args.join(" "));
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = cmd.output();
        let output = match self.config.timeout().filter(|_| bounded) {
            Some(limit) => tokio::time::timeout(limit, output).await.map_err(|_| {
                DimseError::operation_failed(format!("{} timed out after {:?}", program, limit))
            })?,
            None => output.await,
        };

        output.map_err(|e| DimseError::operation_failed(format!("Failed to spawn {}: {}", program, e)))
    }

    #[cfg(not(feature = "dcmtk_cli"))]
    async fn run_tool(&self, program: &str, _args: &[String], _bounded: bool) -> Result<Output> {
        Err(DimseError::NotSupported(format!(
            "{} requires feature 'dcmtk_cli'",
            program
        )))
    }

    async fn echo(&self, request: &DimseRequest) -> Result<OperationResult> {
        info!(
            "Sending C-ECHO to {}@{}:{}",
            request.target.ae_title, request.target.host, request.target.port
        );
        let output = self.run_tool("echoscu", &echo_args(request), true).await?;
        Ok(result_from_output("echoscu", &output))
    }

    async fn find(&self, request: &DimseRequest) -> Result<OperationResult> {
        info!(
            "Sending C-FIND to {}@{}:{} ({} keys)",
            request.target.ae_title,
            request.target.host,
            request.target.port,
            request.tags.len()
        );

        let out_dir = tempfile::Builder::new().prefix("pacs_find_").tempdir()?;
        let output = self
            .run_tool("findscu", &find_args(request, out_dir.path()), true)
            .await?;

        let result = result_from_output("findscu", &output);
        if !result.code.is_usable() {
            return Ok(result);
        }

        let dir = out_dir.path().to_path_buf();
        let matches = tokio::task::spawn_blocking(move || collect_find_responses(&dir))
            .await
            .map_err(|e| DimseError::operation_failed(format!("find response task failed: {}", e)))??;

        debug!("C-FIND returned {} matches", matches.len());
        Ok(result.with_container(serde_json::to_string(&matches)?))
    }

    async fn retrieve(&self, request: &DimseRequest) -> Result<OperationResult> {
        let storage_root = request
            .storage_path
            .clone()
            .ok_or_else(|| DimseError::invalid_request("retrieve requires a storage path"))?;

        let incoming = storage_root.join(INCOMING_DIR);
        let staging = match request.operation {
            DimseOperation::Get => incoming.join(uuid::Uuid::new_v4().to_string()),
            _ => incoming,
        };
        tokio::fs::create_dir_all(&staging).await?;

        info!(
            "Sending {} to {}@{}:{} (level: {})",
            request.operation,
            request.target.ae_title,
            request.target.host,
            request.target.port,
            request
                .tag_value(crate::types::tags::QUERY_RETRIEVE_LEVEL)
                .unwrap_or("?")
        );

        let (program, args) = match request.operation {
            DimseOperation::Get => ("getscu", get_args(request, &staging)),
            _ => ("movescu", move_args(request)),
        };
        let run = self.run_tool(program, &args, true).await;

        let study_filter = request
            .tag_value(crate::types::tags::STUDY_INSTANCE_UID)
            .map(str::to_string);
        let relocate_from = staging.clone();
        let relocate_to = storage_root.clone();
        let relocated = tokio::task::spawn_blocking(move || {
            relocate_received(&relocate_from, &relocate_to, study_filter.as_deref())
        })
        .await
        .map_err(|e| DimseError::operation_failed(format!("relocation task failed: {}", e)))??;

        if request.operation == DimseOperation::Get {
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                warn!("Failed to remove staging dir {}: {}", staging.display(), e);
            }
        }

        let output = run?;
        let mut result = result_from_output(program, &output);
        if !output.status.success() && relocated > 0 {
            result.code = ResultCode::PartialSuccess;
        }
        debug!("{} relocated {} instances", request.operation, relocated);
        Ok(result)
    }

    async fn shutdown(&self, request: &DimseRequest) -> Result<OperationResult> {
        info!("Sending shutdown request to {}", request.target.ae_title);
        let output = self.run_tool("termscu", &shutdown_args(request), true).await?;
        Ok(result_from_output("termscu", &output))
    }

    async fn start_listener(&self, request: &DimseRequest) -> Result<OperationResult> {
        let storage_root = request
            .storage_path
            .clone()
            .ok_or_else(|| DimseError::invalid_request("listener requires a storage path"))?;
        let incoming = storage_root.join(INCOMING_DIR);
        tokio::fs::create_dir_all(&incoming).await?;

        info!(
            "Starting store listener AET='{}' on :{} -> {}",
            request.source.ae_title,
            request.source.port,
            incoming.display()
        );
        let output = self
            .run_tool("storescp", &listener_args(request, &incoming), false)
            .await?;
        Ok(result_from_output("storescp", &output))
    }

    async fn recompress(&self, request: &DimseRequest) -> Result<OperationResult> {
        let input = request
            .source_path
            .clone()
            .ok_or_else(|| DimseError::invalid_request("recompress requires a source path"))?;
        let transfer_syntax = request
            .transfer_syntax
            .clone()
            .unwrap_or_else(|| self.config.transfer_syntax.clone());

        let file_name = input
            .file_name()
            .ok_or_else(|| DimseError::invalid_request("source path has no file name"))?
            .to_owned();
        let out_dir = match (&request.storage_path, input.parent()) {
            (Some(dir), _) => dir.clone(),
            (None, Some(parent)) => parent.to_path_buf(),
            (None, None) => return Err(DimseError::invalid_request("source path has no parent")),
        };
        let output_path = out_dir.join(&file_name);

        let probe = input.clone();
        let current = tokio::task::spawn_blocking(move || read_transfer_syntax(&probe))
            .await
            .map_err(|e| DimseError::operation_failed(format!("probe task failed: {}", e)))?;
        match current {
            Ok(current) if current == transfer_syntax && output_path == input => {
                debug!("{} already in {}", input.display(), transfer_syntax);
                return Ok(OperationResult::success());
            }
            Ok(_) => {}
            Err(e) => {
                return Ok(OperationResult::failure(
                    SIGNALLED_EXIT,
                    format!("cannot read {}: {}", input.display(), e),
                ))
            }
        }

        let (program, flags) = recompress_command(&transfer_syntax).ok_or_else(|| {
            DimseError::NotSupported(format!("no encoder for transfer syntax {}", transfer_syntax))
        })?;

        let temp_path = out_dir.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            uuid::Uuid::new_v4()
        ));
        let mut args: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        if request.verbose {
            args.push("-v".into());
        }
        args.push(input.to_string_lossy().to_string());
        args.push(temp_path.to_string_lossy().to_string());

        let output = self.run_tool(program, &args, true).await?;
        let result = result_from_output(program, &output);
        if result.code == ResultCode::Success {
            tokio::fs::rename(&temp_path, &output_path).await?;
        } else if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            debug!("No temporary output to remove at {}: {}", temp_path.display(), e);
        }
        Ok(result)
    }
}

#[async_trait]
impl DimseNetwork for DimseScu {
    async fn execute(&self, request: DimseRequest) -> Result<OperationResult> {
        match request.operation {
            DimseOperation::Echo => self.echo(&request).await,
            DimseOperation::Find => self.find(&request).await,
            DimseOperation::Move | DimseOperation::Get => self.retrieve(&request).await,
            DimseOperation::Shutdown => self.shutdown(&request).await,
            DimseOperation::StartListener => self.start_listener(&request).await,
            DimseOperation::Recompress => self.recompress(&request).await,
        }
    }
}

fn association_args(request: &DimseRequest) -> Vec<String> {
    let mut args = vec![
        "-aet".to_string(),
        request.source.ae_title.clone(),
        "-aec".to_string(),
        request.target.ae_title.clone(),
    ];
    if request.verbose {
        args.push("-v".into());
    }
    args
}

fn key_args(request: &DimseRequest) -> Vec<String> {
    let mut args = Vec::with_capacity(request.tags.len() * 2);
    for tag in &request.tags {
        args.push("-k".into());
        args.push(format!("{}={}", tag.dcmtk_key(), tag.value));
    }
    args
}

fn peer_args(request: &DimseRequest) -> [String; 2] {
    [request.target.host.clone(), request.target.port.to_string()]
}

pub(crate) fn echo_args(request: &DimseRequest) -> Vec<String> {
    let mut args = association_args(request);
    args.extend(peer_args(request));
    args
}

pub(crate) fn find_args(request: &DimseRequest, out_dir: &Path) -> Vec<String> {
    let mut args = association_args(request);
    // Study Root information model
    args.push("-S".into());
    args.extend(key_args(request));
    args.push("-X".into());
    args.push("-od".into());
    args.push(out_dir.to_string_lossy().to_string());
    args.extend(peer_args(request));
    args
}

pub(crate) fn get_args(request: &DimseRequest, out_dir: &Path) -> Vec<String> {
    let mut args = association_args(request);
    args.push("-S".into());
    args.extend(key_args(request));
    args.push("-od".into());
    args.push(out_dir.to_string_lossy().to_string());
    args.extend(peer_args(request));
    args
}

pub(crate) fn move_args(request: &DimseRequest) -> Vec<String> {
    let mut args = association_args(request);
    args.push("-aem".into());
    args.push(request.source.ae_title.clone());
    args.push("-S".into());
    args.extend(key_args(request));
    args.extend(peer_args(request));
    args
}

pub(crate) fn shutdown_args(request: &DimseRequest) -> Vec<String> {
    let mut args = association_args(request);
    args.extend(peer_args(request));
    args
}

pub(crate) fn listener_args(request: &DimseRequest, incoming: &Path) -> Vec<String> {
    let mut args = vec!["-aet".to_string(), request.source.ae_title.clone()];
    if request.verbose {
        args.push("-v".into());
    }
    args.push("-od".into());
    args.push(incoming.to_string_lossy().to_string());
    args.push(request.source.port.to_string());
    args
}

/// DCMTK tool and flags producing the given transfer syntax
pub(crate) fn recompress_command(transfer_syntax: &str) -> Option<(&'static str, &'static [&'static str])> {
    match transfer_syntax {
        "1.2.840.10008.1.2" => Some(("dcmconv", &["+ti"])),
        "1.2.840.10008.1.2.1" => Some(("dcmconv", &["+te"])),
        "1.2.840.10008.1.2.2" => Some(("dcmconv", &["+tb"])),
        "1.2.840.10008.1.2.4.50" => Some(("dcmcjpeg", &["+eb"])),
        "1.2.840.10008.1.2.4.51" => Some(("dcmcjpeg", &["+ee"])),
        "1.2.840.10008.1.2.4.57" => Some(("dcmcjpeg", &["+el"])),
        "1.2.840.10008.1.2.4.70" => Some(("dcmcjpeg", &["+e1"])),
        "1.2.840.10008.1.2.4.80" => Some(("dcmcjpls", &["+el"])),
        "1.2.840.10008.1.2.4.81" => Some(("dcmcjpls", &["+en"])),
        "1.2.840.10008.1.2.5" => Some(("dcmcrle", &[])),
        _ => None,
    }
}

fn result_from_output(program: &str, output: &Output) -> OperationResult {
    if output.status.success() {
        return OperationResult::success();
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let code = output.status.code().map(i64::from).unwrap_or(SIGNALLED_EXIT);
    error!(
        "{} failed: status={:?}, stdout={}, stderr={}",
        program,
        output.status.code(),
        stdout,
        stderr
    );
    let code = match ResultCode::from(code) {
        // exit codes 0..=2 from a failed process must not read as success
        ResultCode::Failure(c) => c,
        other => 100 + other.as_i64(),
    };
    OperationResult::failure(code, format!("{} exited with {}: {}", program, code, stderr.trim()))
}

fn read_uid(obj: &dicom_object::InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let element = obj.element(tag).ok()?;
    let value = element.to_str().ok()?;
    let uid = value.trim_end_matches('\0').trim();
    if uid.is_empty() {
        None
    } else {
        Some(uid.to_string())
    }
}

fn read_transfer_syntax(path: &Path) -> Result<String> {
    let file = dicom_object::OpenFileOptions::new()
        .read_until(dicom_dictionary_std::tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?;
    Ok(file
        .meta()
        .transfer_syntax()
        .trim_end_matches('\0')
        .to_string())
}

/// Read the C-FIND responses written by `findscu -X` as DICOM JSON datasets
fn collect_find_responses(dir: &Path) -> Result<Vec<serde_json::Value>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("dcm"))
        .collect();
    files.sort();

    let mut matches = Vec::with_capacity(files.len());
    for path in files {
        let file = match dicom_object::open_file(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Skipping unreadable C-FIND response {}: {}", path.display(), e);
                continue;
            }
        };
        let dataset: &dicom_object::InMemDicomObject = &file;
        matches.push(dicom_json::to_value(dataset)?);
    }
    Ok(matches)
}

/// Move every received file under `staging` to `<storage_root>/<study>/<sop instance>`.
///
/// Files belonging to another study than `study_filter` are left in place.
pub(crate) fn relocate_received(
    staging: &Path,
    storage_root: &Path,
    study_filter: Option<&str>,
) -> Result<usize> {
    use dicom_dictionary_std::tags;

    if !staging.exists() {
        return Ok(0);
    }

    let mut relocated = 0;
    for entry in walkdir::WalkDir::new(staging)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let file = match dicom_object::open_file(path) {
            Ok(file) => file,
            Err(e) => {
                debug!("Leaving non-DICOM file {}: {}", path.display(), e);
                continue;
            }
        };

        let (Some(study), Some(instance)) = (
            read_uid(&file, tags::STUDY_INSTANCE_UID),
            read_uid(&file, tags::SOP_INSTANCE_UID),
        ) else {
            warn!("Received file {} lacks study or instance UID", path.display());
            continue;
        };

        if study_filter.is_some_and(|wanted| wanted != study) {
            continue;
        }
        drop(file);

        let study_dir = storage_root.join(&study);
        std::fs::create_dir_all(&study_dir)
            .map_err(|e| DimseError::Storage(format!("{}: {}", study_dir.display(), e)))?;
        if move_into_place(path, &study_dir.join(&instance))? {
            relocated += 1;
        }
    }
    Ok(relocated)
}

/// Rename a received file to its final location.
///
/// Returns `false` when the file is already gone, which happens when a concurrent
/// retrieve sharing the staging directory relocated it first.
fn move_into_place(path: &Path, destination: &Path) -> Result<bool> {
    match std::fs::rename(path, destination) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !path.exists() => {
            debug!("{} was relocated by another retrieve", path.display());
            Ok(false)
        }
        Err(e) => Err(DimseError::Storage(format!(
            "moving {} to {}: {}",
            path.display(),
            destination.display(),
            e
        ))),
    }
}
