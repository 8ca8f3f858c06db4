pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{ClientHello, ClientRequest, Push, ServerHello};
pub use server::SubscriberServer;
pub use session::{Session, SessionRegistry};
