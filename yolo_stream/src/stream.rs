use crate::{
    capture::CaptureSource,
    pipeline::{FramePipeline, PipelineState, Step},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const FRAME_BOUNDARY: &str = "frame";

pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let part_header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", FRAME_BOUNDARY);
    let mut body = Vec::with_capacity(part_header.len() + jpeg.len() + 2);
    body.extend_from_slice(part_header.as_bytes());
    body.extend_from_slice(jpeg);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

pub trait FrameSink {
    fn is_closed(&self) -> bool;

    fn send(&mut self, part: Bytes) -> Result<(), SinkClosed>;
}

/// Sink backed by a bounded channel whose receiver feeds the response body.
/// The receiver is dropped when the client disconnects.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&mut self, part: Bytes) -> Result<(), SinkClosed> {
        self.tx.blocking_send(part).map_err(|_| SinkClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub outcome: PipelineState,
}

pub struct StreamWriter;

impl StreamWriter {
    pub fn drive<S, K>(
        mut pipeline: FramePipeline<S>,
        sink: &mut K,
        shutdown: &watch::Receiver<bool>,
    ) -> StreamReport
    where
        S: CaptureSource,
        K: FrameSink,
    {
        let mut frames_sent = 0;
        loop {
            if *shutdown.borrow() {
                tracing::info!("Shutting down stream from {}", pipeline.identity());
                pipeline.cancel();
                break;
            }
            if sink.is_closed() {
                pipeline.cancel();
                break;
            }
            match pipeline.advance() {
                Step::Frame(jpeg) => {
                    if sink.send(multipart_part(&jpeg)).is_err() {
                        pipeline.cancel();
                        break;
                    }
                    frames_sent += 1;
                }
                Step::Skipped => continue,
                Step::Ended => break,
            }
        }

        pipeline.close();
        let outcome = pipeline.outcome().unwrap_or(PipelineState::Closed);
        match outcome {
            PipelineState::Failed => tracing::error!(
                "Stream from {} truncated after {} frames",
                pipeline.identity(),
                frames_sent
            ),
            _ => tracing::info!(
                "Stream from {} finished ({:?}) after {} frames",
                pipeline.identity(),
                outcome,
                frames_sent
            ),
        }

        StreamReport {
            frames_sent,
            frames_skipped: pipeline.frames_skipped(),
            outcome,
        }
    }
}

pub struct VideoStream<S: CaptureSource + 'static> {
    pipeline: FramePipeline<S>,
    shutdown: watch::Receiver<bool>,
}

impl<S: CaptureSource + 'static> VideoStream<S> {
    pub fn new(pipeline: FramePipeline<S>, shutdown: watch::Receiver<bool>) -> Self {
        Self { pipeline, shutdown }
    }

    #[instrument(skip(self), fields(source = %self.pipeline.identity()))]
    pub fn spawn(
        self,
    ) -> (
        impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
        JoinHandle<StreamReport>,
    ) {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let pipeline = self.pipeline;
        let shutdown = self.shutdown;

        let handle = tokio::task::spawn_blocking(move || {
            let mut sink = ChannelSink::new(tx);
            StreamWriter::drive(pipeline, &mut sink, &shutdown)
        });

        (ReceiverStream::new(rx).map(Ok), handle)
    }
}
