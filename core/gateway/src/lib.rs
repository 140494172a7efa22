//! Network gateway abstraction for offsync.
//!
//! The engine talks to the backend through [`NetworkGateway`]: one
//! serialized request in, one decoded response out. Requests are plain
//! data ([`SerializedRequest`]) so that offline writes can be persisted in
//! the pending-operation queue and replayed later, possibly by another
//! process.
//!
//! Two gateways ship with the crate:
//! - [`MemoryGateway`]: an in-process backend for tests and demos
//! - [`HttpGateway`]: a REST client built on reqwest

pub mod gateway;
pub mod http;
pub mod memory;
pub mod request;
pub mod response;

pub use gateway::NetworkGateway;
pub use http::{HttpGateway, HttpGatewayConfig};
pub use memory::MemoryGateway;
pub use request::{Expect, Method, RequestFactory, SerializedRequest};
pub use response::{GatewayResponse, Tokens};
