//! Error types for the vSphere binding.

use std::fmt;

/// What went wrong talking to vCenter / ESXi. The coordination layer maps
/// these onto [`crate::outcome::OutcomeKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VsphereErrorKind {
    /// Endpoint unreachable, DNS failure or no active session
    ConnectionError,
    /// Bad credentials or expired session
    AuthenticationError,
    /// `NoPermission` fault or HTTP 403
    AccessDenied,
    /// Unknown object, task or endpoint
    NotFound,
    /// Object is in a state that does not allow the operation
    InvalidState,
    /// Connection dropped mid-request; safe to retry a read
    Transient,
    /// HTTP request deadline elapsed
    Timeout,
    /// Non-success HTTP status not covered above
    ApiError(u16),
    /// SOAP fault returned by the vim25 endpoint
    SoapFault,
    /// JSON / XML parse error
    ParseError,
    Other,
}

#[derive(Debug, Clone)]
pub struct VsphereError {
    pub kind: VsphereErrorKind,
    pub message: String,
}

impl VsphereError {
    pub fn new(kind: VsphereErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::AuthenticationError, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::NotFound, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::InvalidState, msg)
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Transient, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::ApiError(status), msg)
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::SoapFault, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::ParseError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VsphereErrorKind::Timeout, msg)
    }

    /// Whether a read that failed this way may succeed if simply issued again.
    ///
    /// A refused connection or a missing session is permanent: retrying only
    /// delays the inevitable failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            VsphereErrorKind::Transient
                | VsphereErrorKind::Timeout
                | VsphereErrorKind::ApiError(502 | 503 | 504)
        )
    }
}

impl fmt::Display for VsphereError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for VsphereError {}

impl From<reqwest::Error> for VsphereError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else if e.is_request() || e.is_body() {
            Self::transient(format!("HTTP transport error: {e}"))
        } else {
            Self::new(VsphereErrorKind::Other, format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for VsphereError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

impl From<quick_xml::Error> for VsphereError {
    fn from(e: quick_xml::Error) -> Self {
        Self::parse(format!("XML parse error: {e}"))
    }
}

pub type VsphereResult<T> = Result<T, VsphereError>;
