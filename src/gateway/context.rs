use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::HandlerError;
use super::session::Session;

/// What a procedure handler gets to work with: the request input, the
/// session, and the application state the gateway was built with.
///
/// ```ignore
/// pub fn handle(ctx: &Context<App>) -> Result<Value, HandlerError> {
///     let tenant = ctx.tenant_id()?;
///     let input = ctx.input::<CreateRecord>()?;
///     let id = ctx.state().outbox.append(tenant, "record.created", json!(input))?;
///     Ok(json!({ "event_id": id }))
/// }
/// ```
pub struct Context<'a, R> {
    /// Name the procedure was registered under.
    procedure: String,
    /// Raw JSON input from the request.
    input: Value,
    /// Header-derived request variables.
    session: Session,
    state: &'a R,
}

impl<'a, R> Context<'a, R> {
    pub(crate) fn new(procedure: String, input: Value, session: Session, state: &'a R) -> Self {
        Self {
            procedure,
            input,
            session,
            state,
        }
    }

    /// Deserialize the input into a typed struct.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| HandlerError::DecodeFailed(e.to_string()))
    }

    /// Get the raw JSON input.
    pub fn raw_input(&self) -> &Value {
        &self.input
    }

    /// Get the procedure name being handled.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Get the session variables.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// `Unauthorized` if the session carries no user.
    pub fn user_id(&self) -> Result<&str, HandlerError> {
        self.session
            .user_id()
            .ok_or_else(|| HandlerError::Unauthorized("missing user id in session".into()))
    }

    /// `Unauthorized` if the session carries no tenant.
    pub fn tenant_id(&self) -> Result<&str, HandlerError> {
        self.session
            .tenant_id()
            .ok_or_else(|| HandlerError::Unauthorized("missing tenant id in session".into()))
    }

    /// Get the caller's role, if the session has one.
    pub fn role(&self) -> Option<&str> {
        self.session.role()
    }

    /// Get the application state.
    pub fn state(&self) -> &R {
        self.state
    }

    /// Check if the input has a top-level field.
    pub fn has_field(&self, field: &str) -> bool {
        self.input.get(field).is_some()
    }

    /// Check if the input has every one of `fields`.
    pub fn has_fields(&self, fields: &[&str]) -> bool {
        fields.iter().all(|f| self.has_field(f))
    }
}
