//! Remote execution: transport, session protocol, host facade, fleet.

pub mod fleet;
pub mod host;
pub mod session;
pub mod transport;

pub use fleet::Fleet;
pub use host::{DeviceStats, HostCommands, PosixCommands, RemoteHost, WindowsCommands};
pub use session::RemoteSession;
pub use transport::{ExecOutput, SshTransport, Transport};
