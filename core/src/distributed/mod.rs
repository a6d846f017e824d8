//! # Collective exchange
//!
//! Devices never touch each other's shards. Everything that crosses a device
//! boundary (partial forward outputs, top gradients, data-parallel weight
//! gradients) moves through a [`CollectiveExchange`].
//!
//! ## Protocols
//!
//! * **Uniform**: a flat all-to-all. [`UniformTransport`] gives every device a
//!   `crossbeam` inbox and each round every device posts one segment to every inbox.
//! * **Hierarchical**: [`HierarchicalTransport`] publishes segments into shared
//!   peer buffers and crosses a barrier before anyone reads, mirroring intra-node
//!   peer-to-peer copies behind a device barrier.
//!
//! Both sit behind the [`ExchangeTransport`] trait, so a networked transport can
//! be plugged in through [`CollectiveExchange::with_transport`].
//!
//! An exchange is asynchronous: [`CollectiveExchange::exchange_async`] starts one
//! worker per device and returns an [`ExchangeHandle`]. Waiting on it is the only
//! way to reach the destination buffers, so no device can read a half-finished
//! exchange.

pub mod backend;
pub mod cpu_backend;
pub mod exchange;
pub mod peer;

pub use backend::ExchangeTransport;
pub use cpu_backend::UniformTransport;
pub use exchange::{CollectiveExchange, ExchangeGroup, ExchangeHandle, ExchangePlan};
pub use peer::{ExchangeObserver, HierarchicalTransport};
