pub mod envelope;
pub mod framing;
pub mod response;

pub use envelope::{Envelope, Pattern, REPLY_FIELD};
pub use response::{ErrorBody, Response, Status};
