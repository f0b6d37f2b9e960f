use crate::errors::ToolError;
use crate::managers::{opt_str, text_result, unknown_tool, ToolHandler};
use crate::services::logger::Logger;
use crate::services::transfers::{TransferDirection, TransferManager, TransferRecord};
use crate::services::validation::Validation;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tools: uploadFile, downloadFile, batchUploadFiles, batchDownloadFiles,
/// getFileTransferStatus, listFileTransfers.
pub struct TransferToolManager {
    logger: Logger,
    validation: Validation,
    transfers: Arc<TransferManager>,
}

impl TransferToolManager {
    pub fn new(logger: Logger, validation: Validation, transfers: Arc<TransferManager>) -> Self {
        Self {
            logger: logger.child("transfer-tools"),
            validation,
            transfers,
        }
    }

    async fn upload(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let local = self.validation.ensure_string(
            args.get("localPath").unwrap_or(&Value::Null),
            "localPath",
            true,
        )?;
        let remote = self.validation.ensure_string(
            args.get("remotePath").unwrap_or(&Value::Null),
            "remotePath",
            true,
        )?;
        let record = self.transfers.upload(&connection_id, &local, &remote).await?;
        Ok(record_result(
            format!(
                "Uploaded {} to {} ({} bytes)",
                record.local_path, record.remote_path, record.bytes_transferred
            ),
            &record,
        ))
    }

    async fn download(&self, args: &Value) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let remote = self.validation.ensure_string(
            args.get("remotePath").unwrap_or(&Value::Null),
            "remotePath",
            true,
        )?;
        let local = opt_str(args, "localPath").unwrap_or_else(|| default_local_path(&remote));
        let record = self
            .transfers
            .download(&connection_id, &remote, &local)
            .await?;
        Ok(record_result(
            format!(
                "Downloaded {} to {} ({} bytes)",
                record.remote_path, record.local_path, record.bytes_transferred
            ),
            &record,
        ))
    }

    fn batch(&self, args: &Value, direction: TransferDirection) -> Result<Value, ToolError> {
        let connection_id = self.require_connection_id(args)?;
        let files = args
            .get("files")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ToolError::invalid_params("files must be a non-empty array"))?;
        if files.is_empty() {
            return Err(ToolError::invalid_params("files must be a non-empty array"));
        }
        let mut items = Vec::with_capacity(files.len());
        for file in files {
            let remote = file
                .get("remotePath")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::invalid_params("files[].remotePath is required"))?;
            let local = match file.get("localPath").and_then(|v| v.as_str()) {
                Some(local) => local.to_string(),
                None if direction == TransferDirection::Download => default_local_path(remote),
                None => {
                    return Err(ToolError::invalid_params(
                        "files[].localPath is required for uploads",
                    ))
                }
            };
            items.push((local, remote.to_string()));
        }
        let count = items.len();
        let ids = self.transfers.batch(&connection_id, direction, items);
        self.logger.info(
            "batch transfer started",
            Some(&serde_json::json!({
                "connection_id": connection_id,
                "count": count,
            })),
        );
        let mut result = text_result(format!(
            "Started {} transfers; poll getFileTransferStatus with the returned ids",
            count
        ));
        if let Value::Object(map) = &mut result {
            map.insert(
                "transferIds".to_string(),
                Value::Array(ids.into_iter().map(Value::String).collect()),
            );
        }
        Ok(result)
    }

    fn status(&self, args: &Value) -> Result<Value, ToolError> {
        let id = self.validation.ensure_string(
            args.get("transferId").unwrap_or(&Value::Null),
            "transferId",
            true,
        )?;
        let record = self
            .transfers
            .get(&id)
            .ok_or_else(|| ToolError::not_found(format!("Unknown transfer: {}", id)))?;
        Ok(record_result(render_record(&record), &record))
    }

    fn list(&self) -> Result<Value, ToolError> {
        let records = self.transfers.list();
        if records.is_empty() {
            return Ok(text_result("No file transfers"));
        }
        let lines: Vec<String> = records.iter().map(render_record).collect();
        let mut result = text_result(lines.join("\n"));
        if let Value::Object(map) = &mut result {
            map.insert(
                "transfers".to_string(),
                serde_json::to_value(&records).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    fn require_connection_id(&self, args: &Value) -> Result<String, ToolError> {
        self.validation.ensure_string(
            args.get("connectionId").unwrap_or(&Value::Null),
            "connectionId",
            true,
        )
    }
}

fn default_local_path(remote: &str) -> String {
    let base = remote
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or("download");
    format!("./{}", base)
}

fn render_record(record: &TransferRecord) -> String {
    format!(
        "{}  {:?}  {}%  {}/{} bytes  [{}]{}",
        record.id,
        record.direction,
        record.progress,
        record.bytes_transferred,
        record.size,
        record.status.as_str(),
        record
            .error
            .as_ref()
            .map(|e| format!("  error: {}", e))
            .unwrap_or_default(),
    )
}

fn record_result(text: String, record: &TransferRecord) -> Value {
    let mut result = text_result(text);
    if let Value::Object(map) = &mut result {
        map.insert("transferId".to_string(), Value::String(record.id.clone()));
        map.insert(
            "transfer".to_string(),
            serde_json::to_value(record).unwrap_or(Value::Null),
        );
    }
    result
}

#[async_trait]
impl ToolHandler for TransferToolManager {
    async fn handle(&self, tool: &str, args: &Value) -> Result<Value, ToolError> {
        match tool {
            "uploadFile" => self.upload(args).await,
            "downloadFile" => self.download(args).await,
            "batchUploadFiles" => self.batch(args, TransferDirection::Upload),
            "batchDownloadFiles" => self.batch(args, TransferDirection::Download),
            "getFileTransferStatus" => self.status(args),
            "listFileTransfers" => self.list(),
            _ => Err(unknown_tool(tool)),
        }
    }
}
