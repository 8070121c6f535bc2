//! Per-request variables, taken from the inbound request headers.

use std::collections::HashMap;

pub const USER_ID: &str = "x-user-id";
pub const TENANT_ID: &str = "x-tenant-id";
pub const ROLE: &str = "x-role";
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Request variables keyed by lowercased header name.
///
/// Authentication happens upstream; the gateway trusts `x-user-id`,
/// `x-tenant-id` and `x-role` as forwarded to it.
#[derive(Debug, Clone, Default)]
pub struct Session {
    variables: HashMap<String, String>,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw header pairs. Names are lowercased.
    pub fn from_map(variables: HashMap<String, String>) -> Self {
        Self {
            variables: variables
                .into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value))
                .collect(),
        }
    }

    /// Get the user ID (`x-user-id`).
    pub fn user_id(&self) -> Option<&str> {
        self.get(USER_ID)
    }

    /// Get the tenant ID (`x-tenant-id`).
    pub fn tenant_id(&self) -> Option<&str> {
        self.get(TENANT_ID)
    }

    /// Get the user role (`x-role`).
    pub fn role(&self) -> Option<&str> {
        self.get(ROLE)
    }

    /// The client-supplied idempotency key, if any. Blank keys count as absent.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.get(IDEMPOTENCY_KEY)
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    /// Get any session variable by name, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}
