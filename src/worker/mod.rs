mod delivery;
mod dispatcher;
mod report;

pub use delivery::{AckError, Delivery};
pub use dispatcher::{RequeuePolicy, StopReason, Worker};
