//! Configuration options for native frame exchange

/// Default bound on frames collected for one command
pub const DEFAULT_MAX_FRAMES: usize = 256;

/// Default data bytes per outgoing frame; fits a 64 byte ISO 14443-4 frame
pub const DEFAULT_MAX_FRAME_DATA: usize = 55;

/// Configuration options for the [`Framer`](crate::Framer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerConfig {
    /// Maximum number of response frames collected for one command
    pub max_frames: usize,

    /// Maximum parameter bytes sent in a single outgoing frame
    pub max_frame_data: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            max_frame_data: DEFAULT_MAX_FRAME_DATA,
        }
    }
}

impl FramerConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame limit for continuation collection
    pub const fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Set the number of parameter bytes per outgoing frame
    pub const fn with_max_frame_data(mut self, max_frame_data: usize) -> Self {
        self.max_frame_data = max_frame_data;
        self
    }
}
