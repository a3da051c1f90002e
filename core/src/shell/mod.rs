mod registry;
mod ring;
mod session;
mod shell_id;

pub use registry::ShellDescriptor;
pub use registry::ShellPool;
pub use ring::OUTPUT_RING_CAP;
pub use ring::OutputRing;
pub use session::ShellExit;
pub use shell_id::ShellId;
