pub mod hash_ring;
pub mod load_balancer;
pub mod weighting;

pub use hash_ring::{HashRing, DEFAULT_VIRTUAL_NODES};
pub use load_balancer::{Candidate, LoadBalancer, SelectionContext, SelectorState};
