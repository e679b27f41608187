//! Built-in agent types.

pub mod commander;
pub mod digest;
pub mod emitter;
pub mod formatter;

pub use commander::Commander;
pub use digest::Digest;
pub use emitter::Emitter;
pub use formatter::Formatter;
