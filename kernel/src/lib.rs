// API Log Kernel
//
// Buffering, segment writing, leader election and snapshot commits for a
// table of API access logs written by many nodes into one warehouse.

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod invariants;
pub mod layout;
pub mod lease;
pub mod node;
pub mod record;
pub mod replay;
pub mod segment;
pub mod simulate;
pub mod storage;
