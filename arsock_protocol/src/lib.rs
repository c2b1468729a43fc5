pub mod envelope;
pub mod error;
pub mod frame;
pub mod reply;

pub use envelope::{NO_ROUTE, ROUTING_ID_LEN};
pub use error::*;
pub use reply::*;
