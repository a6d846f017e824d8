use super::backend::ExchangeTransport;
use crate::error::{EmbeddingError, Result};
use std::sync::{Arc, Barrier, RwLock};

/// Hook into the publish/consume protocol of a [`HierarchicalTransport`].
pub trait ExchangeObserver: Send + Sync {
    /// `device` has published all of its outgoing segments.
    fn on_publish(&self, device: usize);

    /// `device` has read the segment `source` published for it.
    fn on_consume(&self, device: usize, source: usize);
}

/// Intra-node exchange through peer-accessible buffers.
///
/// A round has two barriers. Every device publishes its segments into its own
/// peer buffer and crosses the publish barrier; only then does it read what the
/// others published for it. The release barrier keeps any device from
/// overwriting its buffer in the next round while a peer is still reading.
pub struct HierarchicalTransport {
    num_devices: usize,
    peer_buffers: Vec<RwLock<Vec<Vec<f32>>>>,
    publish_barrier: Barrier,
    release_barrier: Barrier,
    observer: Option<Arc<dyn ExchangeObserver>>,
}

impl HierarchicalTransport {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            peer_buffers: (0..num_devices).map(|_| RwLock::new(Vec::new())).collect(),
            publish_barrier: Barrier::new(num_devices),
            release_barrier: Barrier::new(num_devices),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExchangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl ExchangeTransport for HierarchicalTransport {
    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn exchange(&self, device: usize, outgoing: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if outgoing.len() != self.num_devices || device >= self.num_devices {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.num_devices],
                got: vec![outgoing.len()],
            });
        }

        let mut failure = match self.peer_buffers[device].write() {
            Ok(mut published) => {
                *published = outgoing;
                None
            }
            Err(_) => Some(EmbeddingError::transport(format!(
                "peer buffer {device} poisoned"
            ))),
        };
        if let Some(observer) = &self.observer {
            observer.on_publish(device);
        }

        self.publish_barrier.wait();

        let mut received = Vec::with_capacity(self.num_devices);
        for (src, buffer) in self.peer_buffers.iter().enumerate() {
            if failure.is_some() {
                break;
            }
            match buffer.read() {
                Ok(segments) => {
                    received.push(segments[device].clone());
                    if let Some(observer) = &self.observer {
                        observer.on_consume(device, src);
                    }
                }
                Err(_) => {
                    let reason = format!("peer buffer {src} poisoned");
                    failure = Some(EmbeddingError::transport(reason));
                }
            }
        }

        // Reached on every path; peers block on it otherwise.
        self.release_barrier.wait();

        match failure {
            Some(err) => Err(err),
            None => Ok(received),
        }
    }
}
