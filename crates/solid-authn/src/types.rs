mod client;
mod issuer;
mod session;
mod token;

pub use self::client::*;
pub use self::issuer::*;
pub use self::session::*;
pub use self::token::*;
