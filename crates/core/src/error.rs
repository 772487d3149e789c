use thiserror::Error;

/// Failures raised by the scheduling and compositing core.
///
/// Collaborators (ffmpeg, image files, ONNX sessions) report through `anyhow`;
/// the scheduler wraps a failing model call in [`InpaintError::Inference`].
#[derive(Debug, Error)]
pub enum InpaintError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("inference failed for window starting at frame {window_start}")]
    Inference {
        window_start: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("model output for window starting at frame {window_start} is malformed: {reason}")]
    ModelOutput { window_start: usize, reason: String },

    #[error("frame {0} was not covered by any window")]
    SchedulingGap(usize),
}
