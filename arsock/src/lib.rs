pub use arsock_client::*;
pub use arsock_protocol::*;
