//! HTTP gateway: the operator surface for workflows, runs and approvals.
//!
//! Every route except `/api/health` requires the configured bearer token.

mod auth;
mod middleware;
mod routes;
mod server;
mod state;

pub use server::GatewayServer;
