//! Presentation layer: wire protocol types, the connection state machine,
//! and the axum-based process wiring that adapts real WebSockets to it.

pub mod rpc;
pub mod server;
pub mod session;

pub use rpc::{RpcError, RpcRequest, RpcResponse};
pub use server::Gateway;
pub use session::{GatewaySession, Transport, TransportError};
