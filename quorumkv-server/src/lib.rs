pub mod address;
pub mod cluster_node;
pub mod config;
pub mod consensus;
pub mod error;
pub mod forward;
pub mod handler;
pub mod inbound;
pub mod protocol;
pub mod router;
pub mod server;

mod peer_server;
mod raft_handler;
mod raft_tick_loop;

pub use address::forwarding_addr;
pub use cluster_node::ClusterNode;
pub use config::{NodeConfig, NodeConfigBuilder, RaftTimings, SnapshotConfig};
pub use consensus::{Consensus, ConsensusStatus};
pub use error::{AddressError, ConsensusError, ForwardError, NodeError, RpcError};
pub use forward::{send_forward, ForwardRequest, ForwardResponse};
pub use inbound::{handle_forward_request, InboundServer};
pub use router::RequestRouter;
