pub mod authority;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod mesh;
pub mod mesh_transport;
pub mod protocol;
pub mod relay;
pub mod relay_client;
pub mod rng;
pub mod scheduler;
pub mod session;
pub mod sync;
pub mod terrain;
pub mod types;
