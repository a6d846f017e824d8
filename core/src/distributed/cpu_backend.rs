use super::backend::ExchangeTransport;
use crate::error::{EmbeddingError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};

type Message = (usize, Vec<f32>);

/// Flat all-to-all over `crossbeam` channels.
///
/// Every device owns one inbox; a round is each device pushing one segment into
/// every inbox (its own included) and draining `num_devices` messages from its own.
/// Messages carry no round id, so rounds must not overlap.
/// [`CollectiveExchange`](super::CollectiveExchange) orders the rounds it issues;
/// a transport shared between two exchanges gets no such ordering.
pub struct UniformTransport {
    num_devices: usize,
    inbox_tx: Vec<Sender<Message>>,
    inbox_rx: Vec<Receiver<Message>>,
}

impl UniformTransport {
    pub fn new(num_devices: usize) -> Self {
        let (inbox_tx, inbox_rx) = (0..num_devices).map(|_| unbounded()).unzip();
        Self {
            num_devices,
            inbox_tx,
            inbox_rx,
        }
    }
}

impl ExchangeTransport for UniformTransport {
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

        for (dst, segment) in outgoing.into_iter().enumerate() {
            self.inbox_tx[dst]
                .send((device, segment))
                .map_err(|_| EmbeddingError::transport(format!("inbox of device {dst} closed")))?;
        }

        let mut received: Vec<Option<Vec<f32>>> = vec![None; self.num_devices];
        for _ in 0..self.num_devices {
            let (src, segment) = self.inbox_rx[device].recv().map_err(|_| {
                EmbeddingError::transport(format!("inbox of device {device} disconnected"))
            })?;
            if received[src].replace(segment).is_some() {
                return Err(EmbeddingError::transport(format!(
                    "device {device} received two segments from {src} in one round"
                )));
            }
        }
        received
            .into_iter()
            .enumerate()
            .map(|(src, seg)| {
                seg.ok_or_else(|| EmbeddingError::transport(format!("segment from {src} missing")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_all_to_all_three_devices() {
        let world = 3;
        let transport = Arc::new(UniformTransport::new(world));

        let handles: Vec<_> = (0..world)
            .map(|device| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || {
                    // Segment for dst carries 10 * src + dst.
                    let outgoing = (0..world)
                        .map(|dst| vec![(10 * device + dst) as f32])
                        .collect();
                    transport.exchange(device, outgoing).unwrap()
                })
            })
            .collect();

        for (device, handle) in handles.into_iter().enumerate() {
            let received = handle.join().unwrap();
            for (src, seg) in received.iter().enumerate() {
                assert_eq!(seg, &vec![(10 * src + device) as f32]);
            }
        }
    }

    #[test]
    fn test_wrong_segment_count() {
        let transport = UniformTransport::new(2);
        assert!(transport.exchange(0, vec![vec![1.0]]).is_err());
    }
}
