pub mod handlers;
pub mod protocol;
pub mod server;

pub use handlers::RpcContext;
