pub mod direct_merge;
pub mod headers;
pub mod http_client;
pub mod orchestrator;
