//! Dimensions of the VGA text-mode buffer.

/// Number of character rows in the VGA text buffer.
pub const BUFFER_HEIGHT: usize = 25;
/// Number of character columns in the VGA text buffer.
pub const BUFFER_WIDTH: usize = 80;
