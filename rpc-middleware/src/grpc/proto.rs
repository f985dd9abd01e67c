//! Protobuf messages carried in `grpc-status-details-bin`.
//!
//! The outer message has the `google.rpc.Status` layout so generic gRPC
//! tooling can still decode it; the business status is its single `Any` detail.

use prost_types::Any;

/// Type URL of the embedded business status detail.
pub const BUSINESS_STATUS_TYPE_URL: &str = "type.googleapis.com/rpc.middleware.v1.BusinessStatus";

/// `google.rpc.Status` wire layout.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}

/// Business status as embedded in [`RpcStatus::details`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct BusinessStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}
