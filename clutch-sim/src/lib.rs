//! Discrete-event simulator for the clutch scheduler.
//!
//! The engine owns the event heap, a seeded PRNG, and per-thread behavior
//! profiles; the scheduler core owns everything else. Identical
//! `(seed, scenario, cpus, duration)` inputs reproduce identical traces.

pub mod config;
pub mod engine;
pub mod event;
pub mod logger;
pub mod rng;
pub mod trace;
pub mod workload;

pub use config::{Scenario, SimConfig};
pub use engine::{Engine, SimReport};
pub use event::{Event, EventKind};
pub use rng::Prng;
pub use trace::TraceBuffer;
pub use workload::WorkloadThread;
