//! Dargah — a protocol-aware reverse proxy for PostgreSQL.
//!
//! Clients speak the PostgreSQL v3 wire protocol to the proxy and carry a
//! bearer token as a startup parameter. The proxy authenticates the token,
//! classifies each statement as read or write, enforces role-based access,
//! relays traffic to a health-checked pool of upstream servers, and records
//! every request and statement into a local audit store.

pub mod audit;
pub mod auth;
pub mod classify;
pub mod health;
pub mod http_api;
pub mod metrics;
pub mod pg_wire;
pub mod pool;
pub mod router;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod upstream;

pub use server::Proxy;
