//! HttpSyncServer - ISyncServerApi implementation over HTTP
//!
//! Wraps the [`SyncServerClient`] and maps each port method onto one
//! server operation. Responses are validated here: a success result code
//! that lacks a field the operation must return is an invalid response.

use tracing::{debug, instrument};

use lockstep_core::domain::{FileUuid, OperationId, ServerFileIndexEntry};
use lockstep_core::ports::{
    ApiError, DownloadBlock, FileToDelete, ISyncServerApi, OperationStatus, OperationStatusCode,
    UploadBlock, UploadRecoveryResult,
};

use crate::client::SyncServerClient;
use crate::protocol::{
    op, DeleteFilesRequest, DownloadFileRequest, EmptyRequest, FileRef, InboundFile,
    OperationIdRequest, ServerResponse, SetupInboundTransferRequest, UploadFileRequest,
};
use crate::RemoteError;

/// Sync server adapter for the `ISyncServerApi` port
#[derive(Clone)]
pub struct HttpSyncServer {
    client: SyncServerClient,
}

impl HttpSyncServer {
    pub fn new(client: SyncServerClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SyncServerClient {
        &self.client
    }

    async fn call_empty(&self, operation: &str) -> Result<ServerResponse, ApiError> {
        Ok(self.client.call(operation, &EmptyRequest::default()).await?)
    }
}

/// Extracts a required `ServerOperationId`
fn required_operation_id(
    operation: &str,
    response: &ServerResponse,
) -> Result<OperationId, RemoteError> {
    let id = response.operation_id.as_deref().ok_or_else(|| {
        RemoteError::InvalidResponse(format!("{operation}: missing ServerOperationId"))
    })?;
    OperationId::new(id)
        .map_err(|e| RemoteError::InvalidResponse(format!("{operation}: {e}")))
}

/// Extracts an optional `ServerOperationId`; an empty string means none
fn optional_operation_id(
    operation: &str,
    response: &ServerResponse,
) -> Result<Option<OperationId>, RemoteError> {
    match response.operation_id.as_deref() {
        None | Some("") => Ok(None),
        Some(_) => required_operation_id(operation, response).map(Some),
    }
}

#[async_trait::async_trait]
impl ISyncServerApi for HttpSyncServer {
    #[instrument(skip(self))]
    async fn lock(&self) -> Result<(), ApiError> {
        self.call_empty(op::LOCK).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unlock(&self) -> Result<(), ApiError> {
        self.call_empty(op::UNLOCK).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_file_index(&self) -> Result<Vec<ServerFileIndexEntry>, ApiError> {
        let index = self.call_empty(op::GET_FILE_INDEX).await?.required_index()?;
        debug!(entries = index.len(), "Fetched file index");
        Ok(index)
    }

    #[instrument(skip(self, block), fields(uuid = %block.uuid, block = block.block_index))]
    async fn upload_file_block(&self, block: UploadBlock) -> Result<(), ApiError> {
        self.client
            .call(op::UPLOAD_FILE, &UploadFileRequest::from(&block))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, files), fields(count = files.len()))]
    async fn delete_files(&self, files: &[FileToDelete]) -> Result<(), ApiError> {
        let request = DeleteFilesRequest {
            files: files.iter().map(FileRef::from).collect(),
        };
        self.client.call(op::DELETE_FILES, &request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_outbound_transfer(&self) -> Result<OperationId, ApiError> {
        let response = self.call_empty(op::START_OUTBOUND_TRANSFER).await?;
        Ok(required_operation_id(op::START_OUTBOUND_TRANSFER, &response)?)
    }

    #[instrument(skip(self, files), fields(count = files.len()))]
    async fn setup_inbound_transfer(&self, files: &[FileUuid]) -> Result<(), ApiError> {
        let request = SetupInboundTransferRequest {
            files: files
                .iter()
                .map(|uuid| InboundFile {
                    uuid: uuid.to_string(),
                })
                .collect(),
        };
        self.client.call(op::SETUP_INBOUND_TRANSFER, &request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_inbound_transfer(&self) -> Result<OperationId, ApiError> {
        let response = self.call_empty(op::START_INBOUND_TRANSFER).await?;
        Ok(required_operation_id(op::START_INBOUND_TRANSFER, &response)?)
    }

    #[instrument(skip(self, operation_id), fields(operation_id = %operation_id))]
    async fn check_operation_status(
        &self,
        operation_id: &OperationId,
    ) -> Result<OperationStatus, ApiError> {
        let request = OperationIdRequest {
            operation_id: operation_id.as_str().to_string(),
        };
        let response = self.client.call(op::CHECK_OPERATION_STATUS, &request).await?;

        let raw = response.status_code.ok_or_else(|| {
            ApiError::InvalidResponse("missing ServerOperationStatusCode".into())
        })?;
        let code = OperationStatusCode::from_code(raw)
            .ok_or_else(|| ApiError::InvalidResponse(format!("unknown status code {raw}")))?;

        debug!(status = %code, count = ?response.status_count, "Operation status");
        Ok(OperationStatus {
            code,
            count: response.status_count.unwrap_or(0),
            error: response.status_error,
        })
    }

    #[instrument(skip(self))]
    async fn remove_operation_id(&self) -> Result<(), ApiError> {
        self.call_empty(op::REMOVE_OPERATION_ID).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn upload_recovery(&self) -> Result<UploadRecoveryResult, ApiError> {
        let response = self.call_empty(op::UPLOAD_RECOVERY).await?;
        let operation_id = optional_operation_id(op::UPLOAD_RECOVERY, &response)?;
        let uploaded = response.optional_index()?;
        Ok(UploadRecoveryResult {
            operation_id,
            uploaded,
        })
    }

    #[instrument(skip(self))]
    async fn outbound_transfer_recovery(&self) -> Result<(), ApiError> {
        self.call_empty(op::OUTBOUND_TRANSFER_RECOVERY).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup(&self) -> Result<(), ApiError> {
        self.call_empty(op::CLEANUP).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_operation_id(&self) -> Result<Option<OperationId>, ApiError> {
        let response = self.call_empty(op::GET_OPERATION_ID).await?;
        Ok(optional_operation_id(op::GET_OPERATION_ID, &response)?)
    }

    #[instrument(skip(self, block), fields(uuid = %block.uuid, offset = block.offset))]
    async fn download_file_block(&self, block: DownloadBlock) -> Result<Vec<u8>, ApiError> {
        let data = self
            .client
            .call_bytes(op::DOWNLOAD_FILE, &DownloadFileRequest::from(&block))
            .await?;

        if data.len() as u64 != block.length {
            return Err(ApiError::InvalidResponse(format!(
                "expected {} bytes, got {}",
                block.length,
                data.len()
            )));
        }
        Ok(data)
    }
}
