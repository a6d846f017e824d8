use crate::error::Result;

/// Abstraction for the data movement behind a collective exchange.
///
/// This trait allows swapping between different transports:
/// - **Uniform**: flat all-to-all over channels ([`UniformTransport`](super::cpu_backend::UniformTransport)).
/// - **Hierarchical**: shared peer buffers behind a barrier ([`HierarchicalTransport`](super::peer::HierarchicalTransport)).
///
/// Every participating device calls [`exchange`](Self::exchange) once per round
/// from its own thread.
pub trait ExchangeTransport: Send + Sync {
    /// Number of participating devices.
    fn num_devices(&self) -> usize;

    /// Sends `outgoing[dst]` to every device `dst` and returns the segments
    /// addressed to `device`, indexed by source.
    ///
    /// Returns only once every source's segment for `device` has arrived.
    fn exchange(&self, device: usize, outgoing: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>>;
}
