// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging configuration types

use serde::{Deserialize, Serialize};

use crate::{Level, LogFormat, Logger, LoggingError};

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level")]
    pub level: Option<String>,

    /// Output format for log lines
    #[serde(rename = "log-format")]
    pub format: Option<LogFormat>,

    /// Print the caller's path as compiled instead of just its file name
    #[serde(rename = "full-path")]
    pub full_path: Option<bool>,
}

impl LoggingConfig {
    /// Apply every configured setting to `logger`, leaving the rest untouched.
    pub fn apply(&self, logger: &Logger) -> Result<(), LoggingError> {
        if let Some(level) = &self.level {
            logger.set_level(level.parse::<Level>()?);
        }
        if let Some(format) = self.format {
            logger.set_format(format);
        }
        if let Some(full_path) = self.full_path {
            logger.set_full_path(full_path);
        }
        Ok(())
    }
}
