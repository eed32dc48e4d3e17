mod socket;

pub(crate) use socket::same_socket;
pub use socket::{SharedSocket, Socket};
