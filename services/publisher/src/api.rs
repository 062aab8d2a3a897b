//! Cloud storage REST protocol: request construction and response validation.
//!
//! Follows the Dropbox API v2 contract. Every response is checked for a 200
//! status first and then decoded into a typed shape; anything that does not
//! fit is an [`ApiError`].

use crate::remote::RemoteFile;
use crate::transport::{ApiRequest, ApiResponse, RequestBody};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const LIST_FOLDER_PATH: &str = "/2/files/list_folder";
pub const LIST_FOLDER_CONTINUE_PATH: &str = "/2/files/list_folder/continue";
pub const CREATE_FOLDER_PATH: &str = "/2/files/create_folder_v2";
pub const UPLOAD_PATH: &str = "/2/files/upload";

pub const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// Errors raised while validating a response.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Response has has_more=true but no cursor")]
    MissingCursor,

    #[error("Uploaded file name {0:?} is not a timestamp")]
    InvalidFileName(String),

    #[error("Created folder {actual:?}, expected {expected:?}")]
    FolderMismatch { expected: String, actual: String },
}

/// Credentials and host names stamped on every request.
#[derive(Debug, Clone)]
pub struct ApiContext {
    pub access_token: String,
    pub api_host: String,
    pub content_host: String,
}

#[derive(Debug, Serialize)]
struct ListFolderArg<'a> {
    path: &'a str,
    recursive: bool,
    include_media_info: bool,
    include_deleted: bool,
    include_has_explicit_shared_members: bool,
}

#[derive(Debug, Serialize)]
struct ListFolderContinueArg<'a> {
    cursor: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateFolderArg<'a> {
    path: &'a str,
    autorename: bool,
}

/// Argument of an upload call, carried in the `Dropbox-API-Arg` header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadArg {
    pub path: String,
}

impl ApiContext {
    fn metadata_request(&self, label: &'static str, path: &str, body: String) -> ApiRequest {
        ApiRequest::new(label, Method::POST, path)
            .with_header("Host", self.api_host.as_str())
            .with_header("Authorization", format!("Bearer {}", self.access_token))
            .with_header("Content-Type", "application/json")
            .with_body(RequestBody::Json(body))
    }

    /// List the entries directly under `path` ("" is the root).
    pub fn list_folder(&self, path: &str) -> Result<ApiRequest, ApiError> {
        let body = serde_json::to_string(&ListFolderArg {
            path,
            recursive: false,
            include_media_info: false,
            include_deleted: false,
            include_has_explicit_shared_members: false,
        })?;
        Ok(self.metadata_request("list_folder", LIST_FOLDER_PATH, body))
    }

    /// Fetch the next page of a listing.
    pub fn list_folder_continue(&self, cursor: &str) -> Result<ApiRequest, ApiError> {
        let body = serde_json::to_string(&ListFolderContinueArg { cursor })?;
        Ok(self.metadata_request("list_folder_continue", LIST_FOLDER_CONTINUE_PATH, body))
    }

    pub fn create_folder(&self, path: &str) -> Result<ApiRequest, ApiError> {
        let body = serde_json::to_string(&CreateFolderArg {
            path,
            autorename: false,
        })?;
        Ok(self.metadata_request("create_folder", CREATE_FOLDER_PATH, body))
    }

    /// Upload `data` as the file described by `arg`.
    ///
    /// The payload is attached by reference; calling this again for a retry
    /// shares the same buffer.
    pub fn upload(&self, arg: &UploadArg, data: bytes::Bytes) -> Result<ApiRequest, ApiError> {
        let arg_json = serde_json::to_string(arg)?;
        Ok(ApiRequest::new("upload", Method::POST, UPLOAD_PATH)
            .with_header("Host", self.content_host.as_str())
            .with_header("Authorization", format!("Bearer {}", self.access_token))
            .with_header(API_ARG_HEADER, arg_json)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(RequestBody::Bytes(data)))
    }
}

/// Check the status and decode the body.
pub fn decode<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, ApiError> {
    if response.status != 200 {
        return Err(ApiError::Status {
            status: response.status,
            body: response.body_text(),
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

/// One page of a folder listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ListFolderPage {
    pub entries: Vec<serde_json::Value>,
    pub has_more: bool,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl ListFolderPage {
    /// Cursor for the next page, `None` when this is the last one.
    pub fn next_cursor(&self) -> Result<Option<&str>, ApiError> {
        if !self.has_more {
            return Ok(None);
        }
        self.cursor
            .as_deref()
            .map(Some)
            .ok_or(ApiError::MissingCursor)
    }

    /// Whether a folder whose lowercase path is `path_lower` is listed.
    pub fn contains_folder(&self, path_lower: &str) -> bool {
        self.entries.iter().any(|entry| {
            matches!(
                Entry::from_value(entry),
                Some(Entry::Folder { path_lower: ref p }) if p == path_lower
            )
        })
    }

    /// Every well-formed, timestamp-named file on this page.
    ///
    /// Invalid entries, folders and files whose name is not a positive
    /// decimal timestamp are logged and skipped.
    pub fn files(&self) -> Vec<RemoteFile> {
        let mut files = Vec::new();
        for value in &self.entries {
            match Entry::from_value(value) {
                Some(Entry::File(metadata)) => match metadata.into_remote_file() {
                    Ok(file) => files.push(file),
                    Err(e) => warn!(error = %e, "Skipping listed file"),
                },
                Some(Entry::Folder { path_lower }) => {
                    warn!(path = %path_lower, "Skipping unexpected folder in app folder")
                }
                Some(Entry::Other { tag }) => {
                    warn!(tag = %tag, "Skipping unexpected entry in app folder")
                }
                None => warn!(entry = %value, "Skipping invalid listing entry"),
            }
        }
        files
    }
}

/// Metadata of an uploaded or listed file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub path_lower: String,
    pub size: u64,
    pub client_modified: String,
}

impl FileMetadata {
    pub fn into_remote_file(self) -> Result<RemoteFile, ApiError> {
        let timestamp = parse_timestamp(&self.name)?;
        Ok(RemoteFile {
            name: self.name,
            remote_path: self.path_lower,
            size: self.size,
            last_modified: self.client_modified,
            upload_timestamp: timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FolderMetadata {
    path_lower: String,
}

#[derive(Debug, Deserialize)]
struct CreateFolderResult {
    metadata: FolderMetadata,
}

/// Validate a folder creation response against the requested path.
pub fn created_folder(response: &ApiResponse, expected_lower: &str) -> Result<(), ApiError> {
    let result: CreateFolderResult = decode(response)?;
    if result.metadata.path_lower != expected_lower {
        return Err(ApiError::FolderMismatch {
            expected: expected_lower.to_string(),
            actual: result.metadata.path_lower,
        });
    }
    Ok(())
}

/// Validate an upload response into the record of the stored file.
pub fn uploaded_file(response: &ApiResponse) -> Result<RemoteFile, ApiError> {
    decode::<FileMetadata>(response)?.into_remote_file()
}

fn parse_timestamp(name: &str) -> Result<u64, ApiError> {
    match name.parse::<u64>() {
        Ok(ts) if ts > 0 => Ok(ts),
        _ => Err(ApiError::InvalidFileName(name.to_string())),
    }
}

#[derive(Debug)]
enum Entry {
    Folder { path_lower: String },
    File(FileMetadata),
    Other { tag: String },
}

impl Entry {
    fn from_value(value: &serde_json::Value) -> Option<Self> {
        let tag = value.get(".tag")?.as_str()?;
        match tag {
            "folder" => Some(Entry::Folder {
                path_lower: value.get("path_lower")?.as_str()?.to_string(),
            }),
            "file" => serde_json::from_value(value.clone()).ok().map(Entry::File),
            other => Some(Entry::Other {
                tag: other.to_string(),
            }),
        }
    }
}
