use serde::{Deserialize, Serialize};

use crate::resource::{Attributes, InstanceKey};

/// Envelope every endpoint of the provisioning API answers with.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiError>,
    pub result: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    #[allow(dead_code)] // NOTE: Kept for debug output of failed calls
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResourceBody<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<&'a InstanceKey>,
    pub attributes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
pub struct RemoteResource {
    pub id: String,
    #[serde(default)]
    pub outputs: Attributes,
}
