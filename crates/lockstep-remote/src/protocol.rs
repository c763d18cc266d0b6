//! Sync server wire protocol
//!
//! Every operation is a `POST {base_url}/{OperationName}` with a JSON body.
//! The client adds `MobileDeviceUUID` to every body, so the request types
//! here carry only the operation's own parameters.
//!
//! ## Responses
//!
//! | Key                          | Type        | Present for                        |
//! |------------------------------|-------------|------------------------------------|
//! | `ServerResult`               | integer     | always                             |
//! | `ServerErrorDetails`         | string      | failures                           |
//! | `ServerOperationId`          | string      | transfers, recovery, GetOperationId|
//! | `ServerFileIndex`            | array       | GetFileIndex, UploadRecovery       |
//! | `ServerOperationStatusCode`  | integer     | CheckOperationStatus               |
//! | `ServerOperationStatusCount` | integer     | CheckOperationStatus               |
//! | `ServerOperationStatusError` | string      | CheckOperationStatus               |
//!
//! `DownloadFile` answers with the raw block bytes instead of JSON, unless
//! it fails.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use lockstep_core::domain::{FileUuid, RemoteName, ServerFileIndexEntry};
use lockstep_core::ports::{DownloadBlock, FileToDelete, UploadBlock};

use crate::RemoteError;

/// Operation names, used as the last path segment of each endpoint
pub mod op {
    pub const LOCK: &str = "Lock";
    pub const UNLOCK: &str = "Unlock";
    pub const GET_FILE_INDEX: &str = "GetFileIndex";
    pub const UPLOAD_FILE: &str = "UploadFile";
    pub const DELETE_FILES: &str = "DeleteFiles";
    pub const START_OUTBOUND_TRANSFER: &str = "StartOutboundTransfer";
    pub const SETUP_INBOUND_TRANSFER: &str = "SetupInboundTransfer";
    pub const START_INBOUND_TRANSFER: &str = "StartInboundTransfer";
    pub const CHECK_OPERATION_STATUS: &str = "CheckOperationStatus";
    pub const REMOVE_OPERATION_ID: &str = "RemoveOperationId";
    pub const UPLOAD_RECOVERY: &str = "UploadRecovery";
    pub const OUTBOUND_TRANSFER_RECOVERY: &str = "OutboundTransferRecovery";
    pub const CLEANUP: &str = "Cleanup";
    pub const GET_OPERATION_ID: &str = "GetOperationId";
    pub const DOWNLOAD_FILE: &str = "DownloadFile";
}

/// Key under which the client identifies the device in every request
pub const DEVICE_ID_KEY: &str = "MobileDeviceUUID";

// ============================================================================
// Result codes
// ============================================================================

/// Value of `ServerResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    OperationFailed,
    /// The request was malformed or not allowed
    ApiError,
    /// The server could not reach cloud storage
    NetworkFailure,
    LockAlreadyHeld,
    LockNotHeld,
    /// An earlier identical request is still running; treated as success
    OperationInProgress,
    Unknown(i64),
}

impl ResultCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Ok,
            2 => Self::OperationFailed,
            4 => Self::ApiError,
            5 => Self::NetworkFailure,
            100 => Self::LockAlreadyHeld,
            101 => Self::LockNotHeld,
            300 => Self::OperationInProgress,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::OperationFailed => 2,
            Self::ApiError => 4,
            Self::NetworkFailure => 5,
            Self::LockAlreadyHeld => 100,
            Self::LockNotHeld => 101,
            Self::OperationInProgress => 300,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::OperationInProgress)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::OperationFailed => "operation_failed",
            Self::ApiError => "api_error",
            Self::NetworkFailure => "network_failure",
            Self::LockAlreadyHeld => "lock_already_held",
            Self::LockNotHeld => "lock_not_held",
            Self::OperationInProgress => "operation_in_progress",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// JSON body of every non-download response
#[derive(Debug, Default, Deserialize)]
pub struct ServerResponse {
    #[serde(rename = "ServerResult")]
    pub result: Option<i64>,
    #[serde(rename = "ServerErrorDetails")]
    pub error_details: Option<String>,
    #[serde(rename = "ServerOperationId")]
    pub operation_id: Option<String>,
    #[serde(rename = "ServerFileIndex")]
    pub file_index: Option<Vec<IndexEntryDto>>,
    #[serde(rename = "ServerOperationStatusCode")]
    pub status_code: Option<i64>,
    #[serde(rename = "ServerOperationStatusCount")]
    pub status_count: Option<u32>,
    #[serde(rename = "ServerOperationStatusError")]
    pub status_error: Option<String>,
}

impl ServerResponse {
    /// Fails unless `ServerResult` reports success
    ///
    /// # Errors
    /// `RemoteError::InvalidResponse` if `ServerResult` is missing,
    /// `RemoteError::Rejected` for any failure code
    pub fn check(&self) -> Result<(), RemoteError> {
        let code = self
            .result
            .map(ResultCode::from_code)
            .ok_or_else(|| RemoteError::InvalidResponse("missing ServerResult".into()))?;

        if code.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Rejected {
                code,
                details: self
                    .error_details
                    .clone()
                    .unwrap_or_else(|| "no details".to_string()),
            })
        }
    }

    /// Converts `ServerFileIndex`, which must be present
    pub fn required_index(self) -> Result<Vec<ServerFileIndexEntry>, RemoteError> {
        self.optional_index()?
            .ok_or_else(|| RemoteError::InvalidResponse("missing ServerFileIndex".into()))
    }

    /// Converts `ServerFileIndex` if present
    pub fn optional_index(self) -> Result<Option<Vec<ServerFileIndexEntry>>, RemoteError> {
        self.file_index
            .map(|entries| {
                entries
                    .into_iter()
                    .map(ServerFileIndexEntry::try_from)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
    }
}

/// One entry of `ServerFileIndex`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntryDto {
    pub file_id: String,
    pub cloud_file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub app_file_type: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub file_version: u32,
    #[serde(default)]
    pub file_size_bytes: u64,
}

impl TryFrom<IndexEntryDto> for ServerFileIndexEntry {
    type Error = RemoteError;

    fn try_from(dto: IndexEntryDto) -> Result<Self, Self::Error> {
        let uuid = dto
            .file_id
            .parse::<FileUuid>()
            .map_err(|e| RemoteError::InvalidResponse(format!("index entry: {e}")))?;
        let remote_name = RemoteName::new(dto.cloud_file_name)
            .map_err(|e| RemoteError::InvalidResponse(format!("index entry {uuid}: {e}")))?;

        Ok(ServerFileIndexEntry {
            uuid,
            version: dto.file_version,
            remote_name,
            mime_type: dto.mime_type,
            app_file_type: dto.app_file_type,
            deleted: dto.deleted,
            size_bytes: dto.file_size_bytes,
        })
    }
}

impl From<&ServerFileIndexEntry> for IndexEntryDto {
    fn from(entry: &ServerFileIndexEntry) -> Self {
        Self {
            file_id: entry.uuid.to_string(),
            cloud_file_name: entry.remote_name.as_str().to_string(),
            mime_type: entry.mime_type.clone(),
            app_file_type: entry.app_file_type.clone(),
            deleted: entry.deleted,
            file_version: entry.version,
            file_size_bytes: entry.size_bytes,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Body of requests without parameters
#[derive(Debug, Default, Serialize)]
pub struct EmptyRequest {}

/// A file and version, as named in deletions and downloads
#[derive(Debug, Clone, Serialize)]
pub struct FileRef {
    #[serde(rename = "FileUUID")]
    pub uuid: String,
    #[serde(rename = "FileVersion")]
    pub version: u32,
}

impl From<&FileToDelete> for FileRef {
    fn from(file: &FileToDelete) -> Self {
        Self {
            uuid: file.uuid.to_string(),
            version: file.version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadFileRequest {
    #[serde(rename = "FileUUID")]
    pub uuid: String,
    #[serde(rename = "FileVersion")]
    pub version: u32,
    #[serde(rename = "CloudFileName")]
    pub cloud_file_name: String,
    #[serde(rename = "FileMIMEType")]
    pub mime_type: String,
    #[serde(rename = "AppFileType", skip_serializing_if = "Option::is_none")]
    pub app_file_type: Option<String>,
    #[serde(rename = "Undelete")]
    pub undelete: bool,
    #[serde(rename = "BlockIndex")]
    pub block_index: u32,
    #[serde(rename = "BlockCount")]
    pub block_count: u32,
    /// Base64 of the block content
    #[serde(rename = "Data")]
    pub data: String,
}

impl From<&UploadBlock> for UploadFileRequest {
    fn from(block: &UploadBlock) -> Self {
        Self {
            uuid: block.uuid.to_string(),
            version: block.version,
            cloud_file_name: block.attributes.remote_name.as_str().to_string(),
            mime_type: block.attributes.mime_type.clone(),
            app_file_type: block.attributes.app_file_type.clone(),
            undelete: block.undelete,
            block_index: block.block_index,
            block_count: block.block_count,
            data: STANDARD.encode(&block.data),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteFilesRequest {
    #[serde(rename = "FilesToDelete")]
    pub files: Vec<FileRef>,
}

#[derive(Debug, Serialize)]
pub struct InboundFile {
    #[serde(rename = "FileUUID")]
    pub uuid: String,
}

#[derive(Debug, Serialize)]
pub struct SetupInboundTransferRequest {
    #[serde(rename = "FilesToTransferFromCloudStorage")]
    pub files: Vec<InboundFile>,
}

#[derive(Debug, Serialize)]
pub struct OperationIdRequest {
    #[serde(rename = "OperationId")]
    pub operation_id: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadFileRequest {
    #[serde(rename = "FileUUID")]
    pub uuid: String,
    #[serde(rename = "FileVersion")]
    pub version: u32,
    #[serde(rename = "Offset")]
    pub offset: u64,
    #[serde(rename = "Length")]
    pub length: u64,
}

impl From<&DownloadBlock> for DownloadFileRequest {
    fn from(block: &DownloadBlock) -> Self {
        Self {
            uuid: block.uuid.to_string(),
            version: block.version,
            offset: block.offset,
            length: block.length,
        }
    }
}
