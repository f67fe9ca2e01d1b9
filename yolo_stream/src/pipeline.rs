//! Per-request read → infer → encode state machine.
//!
//! A pipeline moves `Idle → Running → {Draining, Failed, Cancelled} → Closed`.
//! It owns its capture source from a successful `start` until `close`, and
//! `close` (also run on drop) releases that source exactly once.

use crate::{
    capture::{CaptureSource, OpenError, SourceIdentity},
    detector::{DetectError, Detector},
};
use std::sync::Arc;
use yolo_inference::Thresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Failed,
    Cancelled,
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum Step {
    Frame(Vec<u8>),
    Skipped,
    Ended,
}

pub struct FramePipeline<S: CaptureSource> {
    identity: SourceIdentity,
    detector: Arc<dyn Detector>,
    thresholds: Thresholds,
    source: Option<S>,
    state: PipelineState,
    outcome: Option<PipelineState>,
    frames_read: u64,
    frames_emitted: u64,
    frames_skipped: u64,
}

impl<S: CaptureSource> FramePipeline<S> {
    pub fn new(identity: SourceIdentity, detector: Arc<dyn Detector>, thresholds: Thresholds) -> Self {
        Self {
            identity,
            detector,
            thresholds,
            source: None,
            state: PipelineState::Idle,
            outcome: None,
            frames_read: 0,
            frames_emitted: 0,
            frames_skipped: 0,
        }
    }

    pub fn start<F>(&mut self, open: F) -> Result<(), OpenError>
    where
        F: FnOnce(&SourceIdentity) -> Result<S, OpenError>,
    {
        if self.state != PipelineState::Idle {
            tracing::warn!("Pipeline for {} started twice", self.identity);
            return Ok(());
        }

        match open(&self.identity) {
            Ok(source) => {
                self.source = Some(source);
                self.state = PipelineState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to open {}: {}", self.identity, e);
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    pub fn advance(&mut self) -> Step {
        if self.state != PipelineState::Running {
            return Step::Ended;
        }
        let Some(source) = self.source.as_mut() else {
            self.state = PipelineState::Failed;
            return Step::Ended;
        };

        let frame = match source.read_next() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(
                    "End of stream for {} after {} frames",
                    self.identity,
                    self.frames_read
                );
                self.state = PipelineState::Draining;
                return Step::Ended;
            }
            Err(e) => {
                tracing::error!(
                    "Read from {} failed after {} frames: {}",
                    self.identity,
                    self.frames_read,
                    e
                );
                self.state = PipelineState::Failed;
                return Step::Ended;
            }
        };
        self.frames_read += 1;

        let inference = match self.detector.infer(&frame, &self.thresholds) {
            Ok(inference) => inference,
            Err(DetectError::Render(e)) => {
                tracing::warn!("Skipping frame {} of {}: {}", self.frames_read, self.identity, e);
                self.frames_skipped += 1;
                return Step::Skipped;
            }
            Err(DetectError::Model(e)) => {
                tracing::error!("Inference on {} failed: {}", self.identity, e);
                self.state = PipelineState::Failed;
                return Step::Ended;
            }
        };

        match inference.annotated.encode_jpeg() {
            Ok(jpeg) => {
                self.frames_emitted += 1;
                Step::Frame(jpeg)
            }
            Err(e) => {
                tracing::warn!("Skipping frame {} of {}: {}", self.frames_read, self.identity, e);
                self.frames_skipped += 1;
                Step::Skipped
            }
        }
    }

    pub fn cancel(&mut self) {
        if self.state == PipelineState::Running {
            tracing::info!("Client for {} disconnected, cancelling", self.identity);
            self.state = PipelineState::Cancelled;
        }
    }

    /// Releases the source if one is held and moves to `Closed`. Safe to call
    /// any number of times.
    pub fn close(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        // A pipeline closed while still running was abandoned by its driver.
        let terminal = match self.state {
            PipelineState::Running => PipelineState::Cancelled,
            other => other,
        };
        if let Some(mut source) = self.source.take() {
            source.release();
        }
        self.outcome = Some(terminal);
        self.state = PipelineState::Closed;
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn outcome(&self) -> Option<PipelineState> {
        self.outcome
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }
}

impl<S: CaptureSource> Drop for FramePipeline<S> {
    fn drop(&mut self) {
        self.close();
    }
}
