/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod requests;
pub mod types;

pub use error::{DaemonError, Result, StorageError, TransportError};
