//! Error types for the memkv coordinator

use crate::common::types::ServerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Membership Errors ===
    #[error("Unknown server id: {0}")]
    UnknownServerId(ServerId),

    #[error("Server {0} disappeared mid-operation")]
    ServerGone(ServerId),

    // === Durable-log Errors ===
    #[error("Durable log head moved, coordinator is no longer leader")]
    StaleLog,

    #[error("Durable log record {0} not found")]
    NoSuchRecord(u64),

    #[error("Corrupted log record: {0}")]
    Corrupted(String),

    #[error("Log store error: {0}")]
    Storage(#[from] sled::Error),

    // === Placement Errors ===
    #[error("No coordinator configured, replication requirements can't be met")]
    NoCoordinator,

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Membership update RPC failed: {0}")]
    RpcFailed(String),

    #[error("Server {0} is not up")]
    ServerNotUp(ServerId),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::UnknownServerId(_) | Error::NoSuchRecord(_) => {
                tonic::Status::new(Code::NotFound, self.to_string())
            }
            Error::ServerGone(_) | Error::ServerNotUp(_) => {
                tonic::Status::new(Code::FailedPrecondition, self.to_string())
            }
            Error::StaleLog => tonic::Status::new(Code::Aborted, self.to_string()),
            Error::InvalidConfig(_) => tonic::Status::new(Code::InvalidArgument, self.to_string()),
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
