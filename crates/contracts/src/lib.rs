use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod env;
pub mod error;
pub mod fields;

pub use error::ServiceError;

/// Flat PHI object as returned to callers; null columns are absent.
pub type PhiData = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Role {
    Admin,
    Doula,
    Other,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doula => "doula",
            Role::Other => "other",
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::from(value.as_str())
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "doula" => Role::Doula,
            _ => Role::Other,
        }
    }
}

/// Per-request principal. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub role: Role,
    pub user_id: String,
    #[serde(default)]
    pub assigned_client_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiFetchRequest {
    pub client_id: String,
    pub requester: Requester,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiUpdateRequest {
    pub client_id: String,
    pub requester: Requester,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSuccess<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiSuccess<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFailure {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ApiFailure {
    pub fn new(error: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.map(str::to_string),
        }
    }
}

/// Parse a client id in canonical hyphenated UUID v4 form.
pub fn parse_client_id(raw: &str) -> Option<Uuid> {
    let raw = raw.trim();
    if raw.len() != 36 {
        return None;
    }
    let id = Uuid::parse_str(raw).ok()?;
    (id.get_version() == Some(uuid::Version::Random) && id.get_variant() == uuid::Variant::RFC4122)
        .then_some(id)
}
