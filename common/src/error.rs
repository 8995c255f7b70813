// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error handling utilities shared across every node-daemon component.
//!
//! [`DaemonError`] carries the exact wire error kinds from the EC2-style
//! bus protocol (see the error payload format in the dispatcher crate).
//! Each variant's [`DaemonError::code`] is the fixed-case string placed in
//! the `"Code"` field of an error reply; it must never be derived from
//! `Display`/`Debug`, whose wording can change independently.

use thiserror::Error;

/// Top-level error type returned by every service-layer operation.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("image not found: {0}")]
    InvalidAmiNotFound(String),

    #[error("key pair not found: {0}")]
    InvalidKeyPairNotFound(String),

    #[error("unknown instance type: {0}")]
    InvalidInstanceType(String),

    #[error("invalid parameter: {0}")]
    InvalidParameterValue(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("instance not found: {0}")]
    InvalidInstanceIdNotFound(String),

    #[error("instance in wrong state: {0}")]
    IncorrectInstanceState(String),

    #[error("resource in wrong state: {0}")]
    IncorrectState(String),

    #[error("volume not found: {0}")]
    InvalidVolumeNotFound(String),

    #[error("volume zone mismatch: {0}")]
    InvalidVolumeZoneMismatch(String),

    #[error("volume in use: {0}")]
    VolumeInUse(String),

    #[error("attachment limit exceeded: {0}")]
    AttachmentLimitExceeded(String),

    #[error("operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("insufficient instance capacity: {0}")]
    InsufficientInstanceCapacity(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("serial console session unavailable: {0}")]
    SerialConsoleSessionUnavailable(String),

    #[error("internal server error: {0}")]
    ServerInternal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DaemonError {
    /// The fixed-case wire code placed in an error reply's `"Code"` field.
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::InvalidAmiNotFound(_) => "InvalidAMIID.NotFound",
            DaemonError::InvalidKeyPairNotFound(_) => "InvalidKeyPair.NotFound",
            DaemonError::InvalidInstanceType(_) => "InvalidInstanceType",
            DaemonError::InvalidParameterValue(_) => "InvalidParameterValue",
            DaemonError::MissingParameter(_) => "MissingParameter",
            DaemonError::InvalidInstanceIdNotFound(_) => "InvalidInstanceID.NotFound",
            DaemonError::IncorrectInstanceState(_) => "IncorrectInstanceState",
            DaemonError::IncorrectState(_) => "IncorrectState",
            DaemonError::InvalidVolumeNotFound(_) => "InvalidVolume.NotFound",
            DaemonError::InvalidVolumeZoneMismatch(_) => "InvalidVolume.ZoneMismatch",
            DaemonError::VolumeInUse(_) => "VolumeInUse",
            DaemonError::AttachmentLimitExceeded(_) => "AttachmentLimitExceeded",
            DaemonError::OperationNotPermitted(_) => "OperationNotPermitted",
            DaemonError::InsufficientInstanceCapacity(_) => "InsufficientInstanceCapacity",
            DaemonError::InvalidTransition(_) => "InvalidTransition",
            DaemonError::SerialConsoleSessionUnavailable(_) => "SerialConsoleSessionUnavailable",
            DaemonError::ServerInternal(_) => "ServerInternal",
            DaemonError::Storage(_) => "ServerInternal",
            DaemonError::Transport(_) => "ServerInternal",
        }
    }

    /// A human-readable message suitable for the error reply's `"Message"` field.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Persistence-layer errors, wrapped into [`DaemonError::Storage`].
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("persistence backend not configured")]
    NotConfigured,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Bus / transport errors, wrapped into [`DaemonError::Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no responders for subject {0}")]
    NoResponders(String),

    #[error("request timed out on subject {0}")]
    Timeout(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
