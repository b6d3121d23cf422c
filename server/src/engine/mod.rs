pub mod bans;
pub mod broadcaster;
pub mod connection;
pub mod dedup;
pub mod events;
pub mod hub;
pub mod presence;
pub mod rate_limiter;
pub mod reaper;
pub mod redis_backend;
pub mod registry;
pub mod relay;
pub mod write_pump;
