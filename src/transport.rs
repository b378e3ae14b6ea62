//! Connection-side operations needed to execute an encrypted command.
//!
//! The wire protocol itself lives behind [`CommandTransport`]; this crate only
//! drives the describe and execute calls and handles cell encryption around
//! them.

use async_trait::async_trait;
use thiserror::Error;

use crate::metadata::{CipherInfo, ColumnKeyEntry, DescribeResult};

/// Handle of a describe RPC whose results have not been read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcHandle(pub u64);

/// A statement parameter. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn null(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeRequest {
    pub statement: String,
    pub parameter_names: Vec<String>,
}

/// A parameter as sent to the server, encrypted when the describe call said so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundParameter {
    pub name: String,
    pub value: Option<Vec<u8>>,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub statement: String,
    pub parameters: Vec<BoundParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumn {
    pub name: String,
    /// Set for encrypted columns.
    pub cipher: Option<CipherInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<ResultColumn>,
    /// Keys referenced by encrypted columns.
    pub keys: Vec<ColumnKeyEntry>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<TransportError> for crate::Error {
    fn from(e: TransportError) -> Self {
        crate::Error::Transport(e.message)
    }
}

/// Operations a connection performs for an encrypted command. Every call is a
/// suspension point and may be abandoned by dropping its future.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Identifier of the server, used to look up trusted key paths.
    fn server(&self) -> &str;

    fn supports_column_encryption(&self) -> bool {
        true
    }

    async fn send_describe(&self, request: DescribeRequest) -> Result<RpcHandle, TransportError>;

    async fn read_describe(&self, handle: RpcHandle) -> Result<DescribeResult, TransportError>;

    async fn execute(&self, request: ExecuteRequest) -> Result<ResultSet, TransportError>;
}
