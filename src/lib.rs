//! rookery - cluster coordination core for a distributed
//! instant-messaging server.
//!
//! Every process joins a cluster as a node, replicates a bounded set of
//! shards ("slots") plus any number of dynamically-created channels, and
//! routes intra-cluster traffic between peers. The core guarantees that
//! every slot and active channel has a current leader, that each shard's
//! replicated log is appended, committed and applied in order, and that
//! messages addressed to a remote shard reach that shard's leader
//! wherever it runs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ClusterServer                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ClusterEventServer: membership + slot assignment log        │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │  SlotManager         │  ChannelManager + ChannelElection    │
//! │  (fixed shards)      │  (on-demand shards)                  │
//! ├──────────────────────┴──────────────────────────────────────┤
//! │  Replica state machine: propose / sync / commit / apply      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  NodeManager + Transport    │    ShardLogStorage (rocksdb)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Framing, the public HTTP API and the end-user messaging semantics are
//! external collaborators: the embedding process supplies a
//! [`transport::NetServer`]/[`transport::NetLink`] pair and optional
//! [`hooks::ServerHooks`].
//!
//! # Quick start
//!
//! ```no_run
//! use rookery::config::Options;
//! use rookery::hooks::ServerHooks;
//! use rookery::server::ClusterServer;
//! use rookery::transport::memory::MemoryMesh;
//!
//! #[tokio::main]
//! async fn main() -> rookery::Result<()> {
//!     let opts = Options::single_node(1, "/tmp/rookery-data");
//!     let mesh = MemoryMesh::new();
//!     let net_server = mesh.server(&opts.addr);
//!     let server = ClusterServer::new(opts, net_server, mesh.connector(), ServerHooks::default())?;
//!     server.start().await?;
//!     // ...
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod keylock;
pub mod nodes;
pub mod observability;
pub mod pool;
pub mod replica;
pub mod server;
pub mod slots;
pub mod storage;
pub mod transport;
pub mod types;

pub use error::{Result, RookeryError};
