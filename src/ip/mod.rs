//! Address assignment engine.
//!
//! This module derives MAC addresses, subnets and IPv4 addresses for every
//! interface of a topology. The computation is a pure function of the graph,
//! the selected [`AssignmentStrategy`] and the [`AddressPool`], so repeated
//! runs produce identical plans.

pub mod allocator;
pub mod assignment;
pub mod mac;
pub mod strategy;

// Re-export commonly used types
pub use allocator::AddressPool;
pub use assignment::{assign_addresses, AddressAssignment, InterfaceAssignment, Subnet, SubnetId};
pub use mac::MacAddr;
pub use strategy::AssignmentStrategy;

/// The strategy's constraints cannot be met for a topology
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error("Unsatisfiable assignment: routing boundary '{node}' has no links")]
    IsolatedBoundary { node: String },

    #[error("Unsatisfiable assignment: {needed} subnets needed but {pool} holds {capacity}")]
    PoolExhausted { pool: String, needed: usize, capacity: u64 },

    #[error("Unsatisfiable assignment: subnet {subnet} needs {needed} addresses but holds {capacity}")]
    SubnetExhausted { subnet: String, needed: usize, capacity: u32 },

    #[error("Unsatisfiable assignment: {what} index {index} does not fit in a MAC address")]
    MacSpaceExhausted { what: &'static str, index: usize },

    #[error("Unsatisfiable assignment: invalid address pool: {0}")]
    InvalidPool(String),
}
