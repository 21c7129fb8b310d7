pub mod pty;
pub mod subprocess;

pub use pty::PtyChannel;
pub use subprocess::{SubprocessChannel, SubprocessEvent};
