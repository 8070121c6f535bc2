//! Gateway integration tests: the full middleware chain around procedure
//! modules, and the HTTP transport.

mod support;
mod dispatch;
