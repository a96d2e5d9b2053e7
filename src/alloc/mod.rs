pub mod audit;
pub mod global;
pub mod guard;
pub mod heap;
pub mod registry;
pub mod tracker;
