//! Wire protocol: message formats, cookie/DoS protection, anti-replay,
//! and inner IP header inspection.

pub mod cookie;
pub mod ip;
pub mod messages;
pub mod replay;

pub use cookie::{CookieChecker, CookieGenerator};
pub use messages::{CookieReply, MessageInitiation, MessageResponse};
pub use replay::ReplayWindow;
