//! Per-partition processing and the machinery that distributes partitions
//! across hosts.

pub(crate) mod bootstrapper;
pub mod checkpointer;
pub(crate) mod controller;
pub(crate) mod enumerator;
pub(crate) mod load_balancer;
pub(crate) mod processor;
pub(crate) mod supervisor;
pub(crate) mod synchronizer;
