pub mod aggregate;
pub mod correlate;
pub mod iteration;
pub mod local_poller;
pub mod pacing;
pub mod phase;
pub mod provider;
