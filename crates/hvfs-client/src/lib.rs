//! HVFS Client - metadata and KV access for client sites
//!
//! A [`ClientContext`] is created from the [`hvfs_common::Config`], registers
//! with the root service and then routes every request through the published
//! rings and its directory cache. Table and KV calls live in [`KvClient`] and
//! the `impl ClientContext` blocks of the `mds`, `mdsl` and `root` modules.
//!
//! # Example
//! ```ignore
//! let ctx = hvfs_client::connect(config).await?;
//! let kv = KvClient::new(ctx);
//! kv.put("users", 42, 0, "alice").await?;
//! ```

pub mod context;
pub mod kv;
pub mod mds;
pub mod mdsl;
pub mod net;
pub mod root;
pub mod rpc;
pub mod transport;

#[cfg(test)]
mod mock;

pub use context::ClientContext;
pub use kv::KvClient;
pub use mds::{ListPage, ListResult, ShardCursor, TableInfo};
pub use net::{TcpTransport, connect};
pub use rpc::{RetryPolicy, RpcClient};
pub use transport::{ReplyRouter, Transport};
