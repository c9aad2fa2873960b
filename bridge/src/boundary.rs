//! Call and error boundary.
//!
//! Host failures never unwind into module code. A failing host operation is
//! captured here, stored in the external reference table, and its handle is
//! parked in the last-exception slot for the module to poll.

use crate::abi::{self, CoreValue};
use crate::bridge::Bridge;
use crate::closure::Closure;
use crate::externref::Handle;
use crate::value::{HostError, HostValue};
use crate::BridgeResult;

impl Bridge {
    /// Run a host operation, capturing its failure.
    ///
    /// On error the error value is stored and `None` is returned; the module
    /// must not read a return value in that case.
    pub fn handle_error<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Bridge) -> Result<T, HostError>,
    {
        match f(self) {
            Ok(value) => Some(value),
            Err(err) => {
                self.capture(err);
                None
            }
        }
    }

    fn capture(&mut self, err: HostError) {
        log::debug!("host call failed: {}", err);
        let handle = self.externs.alloc(HostValue::Error(err));
        if let Some(previous) = self.exception.replace(handle) {
            log::warn!(
                "exception {} overwritten before it was polled",
                previous.as_u32()
            );
            if let Err(err) = self.externs.free(previous) {
                log::warn!("could not free exception {}: {}", previous.as_u32(), err);
            }
        }
    }

    /// Poll and clear the last exception.
    ///
    /// The handle now belongs to the caller.
    pub fn take_exception(&mut self) -> Option<Handle> {
        self.exception.take()
    }

    /// Whether an exception is waiting to be polled.
    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Lower a host return value for the module.
    pub fn lower_result(&mut self, value: HostValue) -> CoreValue {
        abi::lower(value, &mut self.externs)
    }

    /// Lower an optional host return value; absent and nullish become 0.
    pub fn lower_optional(&mut self, value: Option<HostValue>) -> CoreValue {
        abi::lower_optional(value, &mut self.externs)
    }

    /// Deliver a completed asynchronous outcome.
    ///
    /// Calls `on_ok` with the value or `on_err` with the error, then releases
    /// both continuations. Scheduling the completion is the host's business.
    pub fn settle(
        &mut self,
        on_ok: &Closure,
        on_err: &Closure,
        outcome: Result<HostValue, HostError>,
    ) -> BridgeResult<()> {
        let result = match outcome {
            Ok(value) => on_ok.call(self, &[value]),
            Err(err) => on_err.call(self, &[HostValue::Error(err)]),
        };
        on_ok.release(self);
        on_err.release(self);
        result
    }
}
