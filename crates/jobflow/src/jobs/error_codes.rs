// crates/jobflow/src/jobs/error_codes.rs
use std::fmt;

/// Error returned by a job handler. Recorded on the job, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Generic handler failure with no specific code.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Handler.as_str(), message)
    }

    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadPayload.as_str(), message)
    }

    pub fn class(&self) -> ErrorClass {
        classify_error(self.code)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Handler,
    Timeout,
    Panic,
    BadPayload,
    UnknownJobType,
    WorkerShutdown,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "HANDLER_ERROR" => Some(Self::Handler),
            "TIMEOUT" => Some(Self::Timeout),
            "PANIC" => Some(Self::Panic),
            "BAD_PAYLOAD" => Some(Self::BadPayload),
            "UNKNOWN_JOB_TYPE" => Some(Self::UnknownJobType),
            "WORKER_SHUTDOWN" => Some(Self::WorkerShutdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handler => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Panic => "PANIC",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::WorkerShutdown => "WORKER_SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Unknown codes are treated as transient.
pub fn classify_error(code: &str) -> ErrorClass {
    match ErrorCode::parse(code) {
        Some(ErrorCode::BadPayload) | Some(ErrorCode::UnknownJobType) => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_and_type_errors_are_final() {
        assert_eq!(classify_error("BAD_PAYLOAD"), ErrorClass::NonRetryable);
        assert_eq!(classify_error("unknown_job_type"), ErrorClass::NonRetryable);
        assert_eq!(classify_error("TIMEOUT"), ErrorClass::Retryable);
        assert_eq!(classify_error("SOMETHING_NEW"), ErrorClass::Retryable);
    }

    #[test]
    fn display_is_the_bare_message() {
        let err = JobError::msg("boom");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.code, "HANDLER_ERROR");
        assert_eq!(err.class(), ErrorClass::Retryable);
    }
}
