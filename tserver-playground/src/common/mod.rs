pub mod codec;
pub mod lease;
pub mod rpc;
