//! Errors - エラー型と分類
//!
//! Each boundary has its own error enum; `AftershockError` wraps them for
//! callers that want a single type, and `kind()` sorts them for operators.

use crate::app::{BuildError, DispatcherError, HandlerError, MergeError, RegistryError};
use crate::config::ConfigError;
use crate::domain::StatusFormatError;
use crate::ports::{ConnectError, QueueError, RelayStoreError};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（設定かデータの修正が必要）
/// - Infrastructure: データベースやパートナーの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum AftershockError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    RelayStore(#[from] RelayStoreError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    StatusFormat(#[from] StatusFormatError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl AftershockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AftershockError::Queue(_)
            | AftershockError::RelayStore(_)
            | AftershockError::Connect(_) => ErrorKind::Infrastructure,
            AftershockError::Handler(e) => handler_kind(e),
            AftershockError::Merge(e) => merge_kind(e),
            AftershockError::Dispatcher(e) => match e {
                DispatcherError::FirstConnect(_) => ErrorKind::Permanent,
                DispatcherError::Connect(_)
                | DispatcherError::Queue(_)
                | DispatcherError::RelayStore(_) => ErrorKind::Infrastructure,
                DispatcherError::Handler { source, .. } => handler_kind(source),
                DispatcherError::Relay { source, .. } => merge_kind(source),
                DispatcherError::NotConnected => ErrorKind::Transient,
            },
            AftershockError::StatusFormat(_)
            | AftershockError::Config(_)
            | AftershockError::Registry(_)
            | AftershockError::Build(_) => ErrorKind::Permanent,
        }
    }
}

fn handler_kind(e: &HandlerError) -> ErrorKind {
    match e {
        HandlerError::Queue(_) => ErrorKind::Infrastructure,
        HandlerError::BadDetails(_) => ErrorKind::Permanent,
        HandlerError::Failed(_) => ErrorKind::Transient,
    }
}

fn merge_kind(e: &MergeError) -> ErrorKind {
    match e {
        MergeError::Store(_) => ErrorKind::Infrastructure,
        _ => ErrorKind::Permanent,
    }
}
