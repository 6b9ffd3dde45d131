// Library exports for the CLI and tests
pub mod aggregate;
pub mod channel;
pub mod config;
pub mod debounce;
pub mod fake;
pub mod identity;
pub mod latest;
pub mod logging;
pub mod normalizer;
pub mod query;
pub mod renderer;
pub mod stats;
pub mod store;
pub mod streaks;
pub mod timefmt;
pub mod tracker;
pub mod value;
pub mod visibility;
