mod awaitable;
mod emitter;

pub use awaitable::Awaitable;
pub use emitter::Emitter;
