//! Flow bookkeeping: endpoint addresses and the queue-pair pool

pub mod address;
pub mod pool;

pub use address::AddressPair;
pub use pool::{EndpointKey, FlowEntry, FlowPool, FlowState, QueueId, QueuePair};
