// Copyright (c) 2024 Botho Foundation

//! Error types for the topology gossip module.

use displaydoc::Display;
use thiserror::Error;

/// Errors produced while decoding a topology payload or wire message.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Wire message too short: {len} bytes, need at least 32
    TooShort {
        /// Length of the rejected message
        len: usize,
    },

    /// Malformed topology payload: {0}
    Malformed(String),
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Errors surfaced by a peer connection.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection closed
    Closed,

    /// I/O error: {0}
    Io(String),

    /// Outbound queue is full
    QueueFull,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors from the external reporting sink.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Failed to connect to sink: {0}
    Connect(String),

    /// Failed to publish to sink: {0}
    Publish(String),
}

/// Errors that can occur in the topology gossip service.
#[derive(Debug, Display, Error)]
pub enum TopoError {
    /// Decode error: {0}
    Decode(#[from] DecodeError),

    /// Transport error: {0}
    Transport(#[from] TransportError),

    /// Sink error: {0}
    Sink(#[from] SinkError),

    /// Unexpected command {cmd} in command set {cmd_set}
    UnexpectedCommand {
        /// Command set the message was tagged with
        cmd_set: u16,
        /// Command the message was tagged with
        cmd: u16,
    },

    /// Service is already running
    AlreadyRunning,

    /// Service is not running
    NotRunning,

    /// Invalid configuration: {0}
    Config(String),
}

/// Result type for topology gossip operations.
pub type TopoResult<T> = Result<T, TopoError>;
