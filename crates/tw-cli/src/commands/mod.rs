//! CLI command implementations

mod connect;
mod disconnect;
mod ip;
mod status;

pub use connect::connect_command;
pub use disconnect::disconnect_command;
pub use ip::ip_command;
pub use status::status_command;
