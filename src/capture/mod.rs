//! Frame Capture Layer
//!
//! The pipeline pulls frames from a [`FrameSource`]. Real screen/window capture
//! lives outside this crate; [`replay::ReplaySource`] feeds recorded images.

pub mod frame;
pub mod replay;

use anyhow::Result;

pub use frame::{Frame, PixelFormat};

/// Source of captured frames
pub trait FrameSource: Send {
    /// Return the next frame, or `None` when no new frame is ready.
    ///
    /// Must not block indefinitely.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Result<Option<Frame>> + Send,
{
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self()
    }
}
