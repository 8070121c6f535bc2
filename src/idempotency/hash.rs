use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Headers that take part in the request hash unless configured otherwise.
pub const DEFAULT_HEADER_WHITELIST: &[&str] = &["content-type"];

#[derive(Serialize)]
struct HashedRequest<'a> {
    body: &'a Value,
    headers: BTreeMap<String, &'a str>,
}

/// SHA-256 (hex) over the canonical JSON of the body plus the whitelisted
/// headers. Header names compare case-insensitively; anything not on the
/// whitelist is ignored.
pub fn request_hash<'a, I, W>(
    body: &Value,
    headers: I,
    whitelist: &[W],
) -> Result<String, serde_json::Error>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
    W: AsRef<str>,
{
    let headers = headers
        .into_iter()
        .filter(|(name, _)| {
            whitelist
                .iter()
                .any(|allowed| allowed.as_ref().eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();
    digest(&HashedRequest { body, headers })
}

/// Key for requests that arrive without an `Idempotency-Key` header, built
/// from everything that identifies the mutation.
pub fn derive_key(
    method: &str,
    path: &str,
    tenant_id: &str,
    user_id: &str,
    body: &Value,
) -> Result<String, serde_json::Error> {
    digest(&(method, path, tenant_id, user_id, body))
}

fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_jcs::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}
