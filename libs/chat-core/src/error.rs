use serde::Serialize;
use serde_json::Value;

/// Tagged union of every error kind the core can surface, matching the wire
/// taxonomy's `code` values. Request and session surfaces each own exactly
/// one conversion helper from this type into their native response shape,
/// rather than re-deriving the mapping at every call site.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("validation failed: {message}")]
    Validation { message: String, fields: Vec<String> },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("contact request required for {target_user_id}")]
    ContactRequestRequired {
        reason: String,
        target_user_id: String,
    },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("rate limited")]
    RateLimited,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),

    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },
}

impl ChatError {
    pub fn not_participant() -> Self {
        ChatError::Forbidden {
            reason: "not a participant".into(),
        }
    }

    pub fn validation(message: impl Into<String>, fields: Vec<String>) -> Self {
        ChatError::Validation {
            message: message.into(),
            fields,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ChatError::NotFound { what: what.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ChatError::Conflict {
            message: message.into(),
        }
    }

    /// Wire `code` in UPPER_SNAKE, per §7.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation { .. } => "VALIDATION_ERROR",
            ChatError::Unauthorized => "UNAUTHORIZED",
            ChatError::Forbidden { .. } => "FORBIDDEN",
            ChatError::ContactRequestRequired { .. } => "CONTACT_REQUEST_REQUIRED",
            ChatError::NotFound { .. } => "NOT_FOUND",
            ChatError::Conflict { .. } => "CONFLICT",
            ChatError::RateLimited => "RATE_LIMITED",
            ChatError::Internal(_) => "INTERNAL_ERROR",
            ChatError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ChatError::Validation { .. } => 400,
            ChatError::Unauthorized => 401,
            ChatError::Forbidden { .. } => 403,
            ChatError::ContactRequestRequired { .. } => 403,
            ChatError::NotFound { .. } => 404,
            ChatError::Conflict { .. } => 409,
            ChatError::RateLimited => 429,
            ChatError::Internal(_) => 500,
            ChatError::ServiceUnavailable { .. } => 503,
        }
    }

    /// `details` object for the wire envelope, or `None` when the kind carries nothing extra.
    pub fn details(&self) -> Option<Value> {
        match self {
            ChatError::Validation { fields, .. } if !fields.is_empty() => {
                Some(serde_json::json!({ "fields": fields }))
            }
            ChatError::ContactRequestRequired { target_user_id, .. } => {
                Some(serde_json::json!({ "targetUserId": target_user_id }))
            }
            _ => None,
        }
    }
}

/// Wire envelope for a failed request (§6.1).
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&ChatError> for ErrorEnvelope {
    fn from(err: &ChatError) -> Self {
        ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                details: err.details(),
            },
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
