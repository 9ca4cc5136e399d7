//! Channel replicas and their out-of-band leader elections.

mod election;
mod manager;

pub use election::{
    storage_last_log_info, write_channel_meta, ChannelElectionManager, ElectionContext,
};
pub use manager::ChannelManager;
