//! Exactly-once recording of a single call
//!
//! Both interceptor flavors open a [`PendingCall`] when the user behavior is
//! invoked and close it when the call is over. Whichever exit path is taken
//! (response, stream end, failure, panic or drop), one line is emitted.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tonic::{Code, Status};

use crate::context::{Payload, RequestInfo, ServerContext};
use crate::logger::AccessLogger;

pub(crate) struct PendingCall {
    logger: Arc<AccessLogger>,
    method: Arc<str>,
    context: Arc<dyn ServerContext>,
    request: RequestInfo,
    start: DateTime<Utc>,
    done: bool,
}

impl PendingCall {
    /// Record the start of a call
    pub(crate) fn begin(
        logger: Arc<AccessLogger>,
        method: Arc<str>,
        context: Arc<dyn ServerContext>,
        request: RequestInfo,
    ) -> Self {
        Self {
            logger,
            method,
            context,
            request,
            start: Utc::now(),
            done: false,
        }
    }

    /// Close the call with its outcome and hand the outcome back unchanged
    pub(crate) fn complete<T: Payload>(self, result: Result<T, Status>) -> Result<T, Status> {
        match &result {
            Ok(response) => self.finish(Some(response)),
            Err(status) => self.fail(status),
        }
        result
    }

    /// Close a call that ended normally
    pub(crate) fn finish(mut self, response: Option<&dyn Payload>) {
        self.emit(response);
    }

    /// Close a call that ended with an error status
    ///
    /// A code already recorded by the behavior wins over the returned one.
    pub(crate) fn fail(mut self, status: &Status) {
        self.record_code(status.code());
        self.emit(None);
    }

    /// Run a piece of user code on behalf of this call
    ///
    /// A panic closes the call as `UNKNOWN` (unless a code is already
    /// recorded) and keeps unwinding with the original payload.
    pub(crate) fn guard<R>(&mut self, f: impl FnOnce() -> R) -> R {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(payload) => self.unwind(payload),
        }
    }

    /// Close the call after a caught panic and resume it
    pub(crate) fn unwind(&mut self, payload: Box<dyn Any + Send>) -> ! {
        self.record_code(Code::Unknown);
        self.emit(None);
        panic::resume_unwind(payload)
    }

    fn record_code(&self, code: Code) {
        if self.context.code().is_none() {
            self.context.set_code(code);
        }
    }

    fn emit(&mut self, response: Option<&dyn Payload>) {
        if self.done {
            return;
        }
        self.done = true;

        // Wall clock may step backwards; keep end >= start.
        let end = Utc::now().max(self.start);
        self.logger.log(
            self.context.as_ref(),
            &self.method,
            self.request,
            response,
            self.start,
            end,
        );
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::trace!(method = %self.method, "call dropped before completion");
        self.record_code(Code::Cancelled);
        self.emit(None);
    }
}
