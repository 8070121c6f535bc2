//! Mutation gateway: the middleware chain wrapped around every procedure.
//!
//! Procedures are registered on a [`Gateway`] as mutations or queries. Each
//! handler receives a [`Context<R>`] with the input, the [`Session`] and the
//! application state `R`.
//!
//! ## Procedure convention
//!
//! ```ignore
//! // src/procedures/records_create.rs
//!
//! pub const PROCEDURE: &str = "records.create";
//! pub const KIND: ProcedureKind = ProcedureKind::Mutation;
//!
//! pub fn guard(ctx: &gateway::Context<App>) -> bool {
//!     ctx.has_fields(&["name"])
//! }
//!
//! pub fn handle(ctx: &gateway::Context<App>) -> Result<Value, gateway::HandlerError> {
//!     let tenant = ctx.tenant_id()?;
//!     let record = ctx.state().records.create(tenant, ctx.input()?)?;
//!     ctx.state().outbox.append(tenant, "record.created", json!(record))?;
//!     Ok(json!(record))
//! }
//! ```

mod context;
mod error;
mod service;
mod session;

pub use context::Context;
pub use error::{GatewayError, HandlerError};
pub use service::{Gateway, ProcedureRequest, ProcedureResponse, SweepReport};
pub use session::Session;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
pub use http::{
    router, serve, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, REPLAYED_HEADER,
};

/// Register procedure modules with a gateway using the convention above.
///
/// Each module must export `PROCEDURE: &str`, `KIND: ProcedureKind`,
/// `guard(ctx) -> bool` and `handle(ctx) -> Result<Value, HandlerError>`.
///
/// ```ignore
/// let gateway = relaygate::register_procedures!(
///     Gateway::new(app, limiter, idempotency),
///     procedures::records_create,
///     procedures::records_list,
/// );
/// ```
#[macro_export]
macro_rules! register_procedures {
    ($gateway:expr, $( $($seg:ident)::+ ),+ $(,)?) => {
        $gateway
        $(
            .guarded(
                $($seg)::+::PROCEDURE,
                $($seg)::+::KIND,
                $($seg)::+::guard,
                $($seg)::+::handle,
            )
        )+
    };
}
