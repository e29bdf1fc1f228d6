//! Operator errors
//!
//! Every handler error is either permanent (the input is wrong and retrying
//! cannot help) or transient (the cluster may accept the same request
//! later). Permanent errors become a Warning Event on the NetworkAssertion.

use crate::validation::EvalError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Invalid NetworkAssertion: {0}")]
    InvalidAssertion(String),

    #[error("Invalid validation rule: {0}")]
    Validation(#[from] EvalError),

    #[error("Failed to encode {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Probe output from pod {pod} is not valid JSON: {source}")]
    InvalidProbeOutput {
        pod: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Write to {name} conflicted with a concurrent update")]
    Conflict { name: String },

    #[error("PolicyReport {name} still conflicted after {attempts} attempts")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    #[error("{kind} {name} was created without a {field}")]
    MissingField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same handler can succeed
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Kube(e) => matches!(api_status(e), Some(400 | 422)),
            Error::InvalidAssertion(_)
            | Error::Validation(_)
            | Error::Serialization { .. }
            | Error::InvalidProbeOutput { .. } => true,
            Error::Conflict { .. }
            | Error::ConflictRetriesExhausted { .. }
            | Error::MissingField { .. } => false,
        }
    }

    /// Short machine-readable reason for Events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesApiError",
            Error::InvalidAssertion(_) => "InvalidNetworkAssertion",
            Error::Validation(_) => "InvalidValidationRule",
            Error::Serialization { .. } => "SerializationFailed",
            Error::InvalidProbeOutput { .. } => "InvalidProbeOutput",
            Error::Conflict { .. } | Error::ConflictRetriesExhausted { .. } => {
                "PolicyReportConflict"
            }
            Error::MissingField { .. } => "IncompleteResponse",
        }
    }
}

/// HTTP status code of an API error response
pub fn api_status(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    api_status(error) == Some(404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    api_status(error) == Some(409)
}
