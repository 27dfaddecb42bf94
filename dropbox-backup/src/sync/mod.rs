pub mod backoff;
pub mod content_hash;
pub mod executor;
pub mod local;
pub mod paths;
pub mod reconcile;
pub mod remote;
pub mod snapshot;
pub mod snapshot_cache;
pub mod transfer;
