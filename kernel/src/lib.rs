// Metasync Kernel
//
// Turns metastore change notifications into idempotent cache
// mutations and drives them into a metadata cache.

pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod event;
pub mod factory;
pub mod mutator;
pub mod observability;
pub mod processor;
pub mod source;
