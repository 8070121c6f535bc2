//! Procedure: records.create

use relaygate::gateway::{Context, HandlerError};
use relaygate::ratelimit::ProcedureKind;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::support::{App, Record};

pub const PROCEDURE: &str = "records.create";
pub const KIND: ProcedureKind = ProcedureKind::Mutation;

#[derive(Deserialize)]
pub struct Input {
    pub name: String,
}

pub fn guard(ctx: &Context<App>) -> bool {
    ctx.has_fields(&["name"])
}

pub fn handle(ctx: &Context<App>) -> Result<Value, HandlerError> {
    let tenant = ctx.tenant_id()?;
    let input = ctx.input::<Input>()?;
    if input.name.is_empty() {
        return Err(HandlerError::Rejected("name must not be empty".into()));
    }

    let record = {
        let mut records = ctx
            .state()
            .records
            .lock()
            .map_err(|_| HandlerError::Other("records lock poisoned".into()))?;
        let record = Record {
            id: records.len() + 1,
            tenant_id: tenant.to_string(),
            name: input.name,
        };
        records.push(record.clone());
        record
    };

    ctx.state()
        .outbox
        .append(tenant, "record.created", json!(record))?;
    Ok(json!(record))
}
