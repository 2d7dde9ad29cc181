//! Ephemeral Azure Pipelines agents on an Incus container host.
//!
//! For each configured pool the daemon keeps the observed number of running
//! agent containers equal to a desired count:
//! - The reconciler periodically lists the fleet and enqueues missing indices
//! - The event listener reacts to deleted-instance events in near-real-time
//! - The builder creates and configures agent containers, one task per index
//! - The reaper force-stops agents whose worker process has died
//!
//! The `incus` module is the only boundary to the container host; everything
//! above it is driven through the [`incus::InstanceServer`] trait and is
//! testable against [`incus::MockServer`].

pub mod config;
pub mod daemon;
pub mod incus;
pub mod pool;
pub mod provision;
