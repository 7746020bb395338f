//! courier-services is the stateful half of Courier: routes, file transfer
//! correlation, text reassembly, and the client that drives them over a
//! pub/sub transport.

pub mod assembly;
pub mod client;
pub mod file_transfer;
pub mod route;
pub mod topic;
pub mod transport;

pub use assembly::{AssembledText, TextAssembler};
pub use client::{Client, ClientError, SendOptions};
pub use file_transfer::{Correlation, CorrelationWarning, FileTransferCoordinator, ReceivedFile};
pub use route::{Delivery, Message, RouteHandler, RouteOptions};
pub use transport::{MemoryBroker, MemoryTransport, Transport, TransportError, TransportEvent};
