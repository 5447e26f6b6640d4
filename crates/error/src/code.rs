use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following QUILT-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Execution errors (worker pool, shard tasks)
/// - **2000-2999**: Routing/SQL errors
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Merge errors
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions (semver contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Execution Errors (1000-1999) ===
    /// QUILT-1001: A shard task failed during execution
    TaskFailed = 1001,
    /// QUILT-1002: Submission after the executor engine was closed
    EngineClosed = 1002,
    /// QUILT-1003: Backend connection could not be obtained
    ConnectionFailed = 1003,

    // === Routing/SQL Errors (2000-2999) ===
    /// QUILT-2001: SQL could not be parsed
    SyntaxError = 2001,
    /// QUILT-2002: Referenced logical table has no table rule
    NoTableRule = 2002,
    /// QUILT-2003: Strategy returned a target outside the configured nodes
    InvalidRouteTarget = 2003,
    /// QUILT-2004: Bound parameter referenced by a condition is missing
    MissingParameter = 2004,
    /// QUILT-2005: Statement shape not supported by the router
    UnsupportedStatement = 2005,
    /// QUILT-2006: INSERT did not resolve to a single data node
    AmbiguousInsertRoute = 2006,

    // === Configuration Errors (3000-3999) ===
    /// QUILT-3001: Datasource map is empty
    EmptyDataSources = 3001,
    /// QUILT-3002: Referenced datasource name is absent from the map
    UnknownDataSource = 3002,
    /// QUILT-3003: Malformed data-node expression
    InvalidDataNode = 3003,
    /// QUILT-3004: Unknown sharding-strategy key
    UnknownStrategy = 3004,
    /// QUILT-3005: Unknown key-generator key
    UnknownKeyGenerator = 3005,

    // === Merge Errors (4000-4999) ===
    /// QUILT-4001: Merge shape not supported (e.g. unresolvable ORDER BY)
    UnsupportedMerge = 4001,
    /// QUILT-4002: Shard streams disagree on inferred ordering or width
    ConflictingStreams = 4002,

    // === Internal Errors (5000-5999) ===
    /// QUILT-5001: Unexpected internal state
    Internal = 5001,

    /// QUILT-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "QUILT-2002")
    pub fn as_str(&self) -> String {
        format!("QUILT-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Execution,
            2000..=2999 => ErrorCategory::Routing,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Merge,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        // Parse "QUILT-XXXX" format
        let num: u16 = s
            .strip_prefix("QUILT-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::TaskFailed),
            1002 => Ok(Self::EngineClosed),
            1003 => Ok(Self::ConnectionFailed),
            2001 => Ok(Self::SyntaxError),
            2002 => Ok(Self::NoTableRule),
            2003 => Ok(Self::InvalidRouteTarget),
            2004 => Ok(Self::MissingParameter),
            2005 => Ok(Self::UnsupportedStatement),
            2006 => Ok(Self::AmbiguousInsertRoute),
            3001 => Ok(Self::EmptyDataSources),
            3002 => Ok(Self::UnknownDataSource),
            3003 => Ok(Self::InvalidDataNode),
            3004 => Ok(Self::UnknownStrategy),
            3005 => Ok(Self::UnknownKeyGenerator),
            4001 => Ok(Self::UnsupportedMerge),
            4002 => Ok(Self::ConflictingStreams),
            5001 => Ok(Self::Internal),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category for adapter-layer mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Execution,
    Routing,
    Config,
    Merge,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::TaskFailed.as_str(), "QUILT-1001");
        assert_eq!(ErrorCode::NoTableRule.as_str(), "QUILT-2002");
        assert_eq!(ErrorCode::Unknown.as_str(), "QUILT-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("QUILT-3001".to_string()).unwrap(),
            ErrorCode::EmptyDataSources
        );
        assert_eq!(
            ErrorCode::try_from("QUILT-9999".to_string()).unwrap(),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn test_error_code_parsing_errors() {
        assert!(ErrorCode::try_from("INVALID".to_string()).is_err());
        assert!(ErrorCode::try_from("QUILT-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("QUILT-ABC".to_string()).is_err());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::EngineClosed.category(), ErrorCategory::Execution);
        assert_eq!(ErrorCode::NoTableRule.category(), ErrorCategory::Routing);
        assert_eq!(ErrorCode::InvalidDataNode.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::UnsupportedMerge.category(), ErrorCategory::Merge);
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Internal);
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Internal);
    }
}
