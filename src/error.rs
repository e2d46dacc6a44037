/*
 * Copyright (c) 2025 Mongora Project. All rights reserved.
 *
 * Mongora - MongoDB aggregation pipeline to Oracle SQL/JSON translator
 *
 * @file error.rs
 * @brief Mongora error handling
 */

use thiserror::Error;

/// A single structural problem found while parsing or validating a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Error, Debug)]
pub enum MongoraError {
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Translation error: {0}")]
    Translation(String),
}

impl MongoraError {
    /// Single-issue validation error.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        MongoraError::Validation(vec![ValidationIssue::new(code, message)])
    }

    pub fn unsupported(operator: impl Into<String>) -> Self {
        MongoraError::UnsupportedOperator(operator.into())
    }

    pub fn translation(reason: impl Into<String>) -> Self {
        MongoraError::Translation(reason.into())
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, MongoraError>;
