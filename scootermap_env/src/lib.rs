//! ScooterMap Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the ScooterMap
//! engine to run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept
//!
//! The aggregation worker never touches a clock or a broker directly:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Transport (`recv()`, `ack()`)
//!
//! are all reached through the traits defined here, so every ingestion
//! scenario (redelivery, reordering, window expiry) is reproducible.
//!
//! # Example
//!
//! ```ignore
//! use scootermap_env::{MobilityContext, ObservationTransport};
//!
//! async fn drain<Ctx: MobilityContext, T: ObservationTransport>(ctx: &Ctx, transport: &T) {
//!     loop {
//!         tokio::select! {
//!             delivery = transport.recv() => handle(delivery),
//!             _ = ctx.sleep(Duration::from_secs(5)) => flush(),
//!         }
//!     }
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;

pub use context::MobilityContext;
pub use transport::{ObservationTransport, RedeliveryController};
pub use types::{Delivery, DeliveryTag, WorkerId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
