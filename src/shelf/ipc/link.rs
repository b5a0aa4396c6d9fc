//! Framed message links
//!
//! A `FrameLink` is the only thing that ever crosses an isolation boundary:
//! a pair of byte queues carrying bincode-encoded `ShelfMessage` frames. The
//! in-memory variant connects a sandboxed worker task to its host, the stream
//! variant runs the same frames over a length-delimited Unix socket.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::shelf::channel::protocol::ShelfMessage;
use crate::shelf::traits::ShelfError;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Bidirectional frame link
pub struct FrameLink {
    sender: FrameSender,
    receiver: FrameReceiver,
}

/// Outgoing half of a link
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Bytes>,
    writer: Option<JoinHandle<()>>,
}

/// Incoming half of a link
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    reader: Option<JoinHandle<()>>,
}

impl FrameLink {
    /// Two in-memory links connected back to back
    pub fn pair() -> (FrameLink, FrameLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            FrameLink {
                sender: FrameSender {
                    tx: a_tx,
                    writer: None,
                },
                receiver: FrameReceiver {
                    rx: a_rx,
                    reader: None,
                },
            },
            FrameLink {
                sender: FrameSender {
                    tx: b_tx,
                    writer: None,
                },
                receiver: FrameReceiver {
                    rx: b_rx,
                    reader: None,
                },
            },
        )
    }

    /// Run the link over a byte stream with length-delimited framing
    pub fn over_stream<T>(stream: T) -> FrameLink
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec()
        };
        let mut framed_read = FramedRead::new(read_half, codec());
        let mut framed_write = FramedWrite::new(write_half, codec());

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Bytes>();

        // Unified writer: drains the outgoing queue until every sender is gone
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = framed_write.send(frame).await {
                    warn!("Failed to write frame: {}", e);
                    break;
                }
            }
            debug!("Frame writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = framed_read.next().await {
                match frame {
                    Ok(bytes) => {
                        if in_tx.send(bytes.freeze()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read frame: {}", e);
                        break;
                    }
                }
            }
            debug!("Frame reader finished");
        });

        FrameLink {
            sender: FrameSender {
                tx: out_tx,
                writer: Some(writer),
            },
            receiver: FrameReceiver {
                rx: in_rx,
                reader: Some(reader),
            },
        }
    }

    pub fn send(&self, message: &ShelfMessage) -> Result<(), ShelfError> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<Result<ShelfMessage, ShelfError>> {
        self.receiver.recv().await
    }

    /// Wait for the worker's first message, which must announce its channel
    ///
    /// Returns the worker's address and channel name. A fault sent in place of
    /// the announcement is returned as `ShelfError::Remote`.
    pub async fn await_listening(&mut self) -> Result<(String, String), ShelfError> {
        match self.recv().await {
            Some(Ok(ShelfMessage::WorkerListening {
                address,
                channel_name,
                ..
            })) => Ok((address, channel_name)),
            Some(Ok(ShelfMessage::ServiceFault { fault, .. })) => Err(ShelfError::Remote(fault)),
            Some(Ok(other)) => Err(ShelfError::Ipc(format!(
                "Expected worker announcement, got {:?}",
                other.kind()
            ))),
            Some(Err(e)) => Err(e),
            None => Err(ShelfError::Ipc(
                "Worker closed its channel before announcing itself".to_string(),
            )),
        }
    }

    pub fn into_parts(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }

    /// Flush outstanding frames and close the link
    pub async fn close(self) {
        let (sender, receiver) = self.into_parts();
        drop(receiver);
        sender.close().await;
    }
}

impl FrameSender {
    /// Encode and enqueue a message
    pub fn send(&self, message: &ShelfMessage) -> Result<(), ShelfError> {
        let frame = message.encode()?;
        self.tx
            .send(frame)
            .map_err(|_| ShelfError::Ipc("link is closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Drop the outgoing queue and wait for queued frames to be written
    pub async fn close(self) {
        let FrameSender { tx, writer } = self;
        drop(tx);
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!("Frame writer task failed: {}", e);
            }
        }
    }
}

impl FrameReceiver {
    /// Next message from the peer, `None` once the peer is gone
    pub async fn recv(&mut self) -> Option<Result<ShelfMessage, ShelfError>> {
        let frame = self.rx.recv().await?;
        Some(ShelfMessage::decode(&frame))
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut host, mut worker) = FrameLink::pair();

        host.send(&ShelfMessage::StartService {
            service_name: "clock".to_string(),
        })
        .unwrap();
        let received = worker.recv().await.unwrap().unwrap();
        assert_eq!(
            received,
            ShelfMessage::StartService {
                service_name: "clock".to_string()
            }
        );

        worker
            .send(&ShelfMessage::ServiceRunning {
                service_name: "clock".to_string(),
            })
            .unwrap();
        let received = host.recv().await.unwrap().unwrap();
        assert_eq!(received.service_name(), "clock");
    }

    #[tokio::test]
    async fn test_recv_ends_when_peer_dropped() {
        let (mut host, worker) = FrameLink::pair();
        drop(worker);

        assert!(host.recv().await.is_none());
        assert!(host
            .send(&ShelfMessage::UnloadService {
                service_name: "clock".to_string()
            })
            .is_err());
    }

    #[tokio::test]
    async fn test_await_listening_surfaces_fault() {
        use crate::shelf::channel::protocol::{FaultReport, FaultStage};

        let (mut host, worker) = FrameLink::pair();
        worker
            .send(&ShelfMessage::ServiceFault {
                service_name: "clock".to_string(),
                fault: FaultReport::new(FaultStage::Creation, "no config"),
            })
            .unwrap();

        match host.await_listening().await {
            Err(ShelfError::Remote(report)) => assert_eq!(report.message, "no config"),
            other => panic!("unexpected handshake result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_link_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let host = FrameLink::over_stream(a);
        let mut worker = FrameLink::over_stream(b);

        host.send(&ShelfMessage::PauseService {
            service_name: "clock".to_string(),
        })
        .unwrap();
        host.close().await;

        let received = worker.recv().await.unwrap().unwrap();
        assert_eq!(received.service_name(), "clock");
        assert!(worker.recv().await.is_none());
    }
}
