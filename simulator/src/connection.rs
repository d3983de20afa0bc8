//! The seam towards the external decision process. The actual socket
//! transport lives outside the core; tests and demos plug in-process
//! schedulers in here.

use crate::errors::ProtocolError;

/// One blocking request/reply exchange with the scheduler. The simulator
/// always speaks first; there is no timeout on the reply.
pub trait SchedulerLink {
    fn round_trip(&mut self, message: &str) -> Result<String, ProtocolError>;
}

/// Adapter turning a closure into a [`SchedulerLink`].
pub struct FnSchedulerLink<F: FnMut(&str) -> String> {
    handler: F,
}

impl<F: FnMut(&str) -> String> FnSchedulerLink<F> {
    pub fn new(handler: F) -> Self {
        FnSchedulerLink { handler }
    }
}

impl<F: FnMut(&str) -> String> SchedulerLink for FnSchedulerLink<F> {
    fn round_trip(&mut self, message: &str) -> Result<String, ProtocolError> {
        Ok((self.handler)(message))
    }
}
