// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, StmError>;

/// The reason a transaction was rolled back. Every variant is retryable.
#[derive(DeriveError, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    #[error("an object read by this transaction was committed by another one")]
    ReadWriteConflict,

    #[error("an object written by this transaction was committed by another one")]
    WriteWriteConflict,

    #[error("abort was requested by another thread")]
    Requested,

    #[error("transaction requested a retry")]
    Explicit,
}

/// Resources whose exhaustion ends a transaction for good.
#[derive(DeriveError, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    #[error("old space")]
    Heap,

    #[error("nursery")]
    Nursery,

    #[error("commit log")]
    CommitLog,

    #[error("root stack")]
    RootStack,
}

#[derive(DeriveError, Debug, Clone, PartialEq, Eq)]
pub enum StmError {
    #[error("Transaction aborted ({0})")]
    Aborted(AbortReason),

    #[error("Resource exhausted ({0})")]
    Exhausted(Resource),

    #[error("Invalid configuration ({0})")]
    Config(String),

    #[error("Protocol violation ({0})")]
    Protocol(&'static str),
}

impl StmError {
    /// Returns `true`, if the transaction can simply be run again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Returns `true`, if the error ended the running transaction
    pub(crate) fn ends_transaction(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::Exhausted(_))
    }
}

impl From<AbortReason> for StmError {
    fn from(reason: AbortReason) -> Self {
        Self::Aborted(reason)
    }
}
