//! Credit-based flow control for remote channels.
//!
//! The receiver advertises an initial credit per channel; the sender spends
//! one credit per data buffer and parks when none remain. Consuming a buffer
//! at the receiver sends credit back. Event frames (barriers, end-of-
//! partition markers) bypass credit so control flow can never deadlock
//! behind data backpressure.

use crate::error::{NetworkError, Result};
use crate::events::StreamFrame;
use crate::subpartition::{AvailabilityListener, PipelinedSubpartition};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Receiver-granted permission to send data buffers on one channel.
pub struct ChannelCredit {
    permits: Semaphore,
}

impl ChannelCredit {
    pub fn new(initial_credit: u32) -> Self {
        Self {
            permits: Semaphore::new(initial_credit as usize),
        }
    }

    /// Spend one credit; waits while none are available.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;
        permit.forget();
        Ok(())
    }

    /// The receiver's `AddCredit(channel, n)` message.
    pub fn add_credit(&self, n: u32) {
        self.permits.add_permits(n as usize);
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Producer-side endpoint of a remote channel.
pub struct RemoteChannelSender {
    tx: mpsc::UnboundedSender<StreamFrame>,
    credit: Arc<ChannelCredit>,
}

impl RemoteChannelSender {
    /// Send one frame, spending credit for data buffers.
    pub async fn send(&self, frame: StreamFrame) -> Result<()> {
        if matches!(&frame, StreamFrame::Buffer(b) if b.is_buffer()) {
            self.credit.acquire().await?;
        }
        self.tx
            .send(frame)
            .map_err(|_| NetworkError::ChannelClosed)
    }

    pub fn credit(&self) -> &Arc<ChannelCredit> {
        &self.credit
    }
}

/// Consumer-side endpoint, wired into an input channel.
pub struct RemoteChannelReceiver {
    pub(crate) rx: mpsc::UnboundedReceiver<StreamFrame>,
    pub(crate) credit: Arc<ChannelCredit>,
}

/// Create both ends of a remote channel with the given initial credit.
pub fn remote_channel(initial_credit: u32) -> (RemoteChannelSender, RemoteChannelReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let credit = Arc::new(ChannelCredit::new(initial_credit));
    (
        RemoteChannelSender {
            tx,
            credit: Arc::clone(&credit),
        },
        RemoteChannelReceiver { rx, credit },
    )
}

struct NotifyOnAvailable {
    notify: Notify,
}

impl AvailabilityListener for NotifyOnAvailable {
    fn notify_data_available(&self) {
        self.notify.notify_one();
    }
}

/// Serve one subpartition to a remote consumer: creates the read view, the
/// credit-governed transport pair, and the pump task that moves frames from
/// the view to the wire. The returned receiver plugs into an input channel
/// on the consuming side.
pub fn bridge_remote(
    subpartition: &Arc<PipelinedSubpartition>,
    initial_credit: u32,
) -> Result<RemoteChannelReceiver> {
    let listener = Arc::new(NotifyOnAvailable {
        notify: Notify::new(),
    });
    let view = subpartition.create_read_view(listener.clone())?;
    let (sender, receiver) = remote_channel(initial_credit);

    tokio::spawn(async move {
        loop {
            let mut ended = false;
            while let Some(polled) = view.poll_next() {
                let is_end = matches!(polled.frame, StreamFrame::EndOfPartition);
                if sender.send(polled.frame).await.is_err() {
                    return;
                }
                if is_end {
                    ended = true;
                    break;
                }
            }
            if ended {
                break;
            }
            listener.notify.notified().await;
        }
    });

    Ok(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use bytes::Bytes;
    use std::time::Duration;

    fn data_frame() -> StreamFrame {
        StreamFrame::Buffer(Buffer::data_buffer(Bytes::from_static(b"r")))
    }

    #[tokio::test]
    async fn test_sender_parks_without_credit() {
        let (sender, _receiver) = remote_channel(2);

        sender.send(data_frame()).await.unwrap();
        sender.send(data_frame()).await.unwrap();
        assert_eq!(sender.credit().available(), 0);

        // Third buffer must wait for credit.
        let blocked = tokio::time::timeout(Duration::from_millis(20), sender.send(data_frame()));
        assert!(blocked.await.is_err());

        sender.credit().add_credit(1);
        tokio::time::timeout(Duration::from_millis(100), sender.send(data_frame()))
            .await
            .expect("credit was added")
            .unwrap();
    }

    #[tokio::test]
    async fn test_events_bypass_credit() {
        let (sender, mut receiver) = remote_channel(0);

        sender.send(StreamFrame::EndOfPartition).await.unwrap();
        assert!(matches!(
            receiver.rx.recv().await,
            Some(StreamFrame::EndOfPartition)
        ));
    }

    #[tokio::test]
    async fn test_send_after_receiver_drop_fails() {
        let (sender, receiver) = remote_channel(1);
        drop(receiver);
        assert!(sender.send(StreamFrame::EndOfPartition).await.is_err());
    }
}
