//! Ending observations of operations that complete asynchronously.
//!
//! [`AsyncCompletionBinder::bind`] wraps the future of a started operation.
//! The observation is ended exactly once, from whichever happens first:
//!
//! * the future resolves: ended with its response or error;
//! * the future is dropped before resolving: ended as a failure with
//!   [`ErrorKind::Cancelled`].
//!
//! An operation that resolves to [`futures_channel::oneshot::Canceled`] was
//! cancelled on the producing side and is recorded the same way.
//!
//! [`ErrorKind::Cancelled`]: crate::ErrorKind::Cancelled
use crate::{Context, Instrumenter};
use futures_channel::oneshot::Canceled;
use pin_project_lite::pin_project;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

/// Binds the completion of asynchronous operations to their observations.
pub struct AsyncCompletionBinder<Req, Resp> {
    instrumenter: Instrumenter<Req, Resp>,
}

impl<Req, Resp> Clone for AsyncCompletionBinder<Req, Resp> {
    fn clone(&self) -> Self {
        AsyncCompletionBinder {
            instrumenter: self.instrumenter.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for AsyncCompletionBinder<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCompletionBinder")
            .field("instrumenter", &self.instrumenter)
            .finish()
    }
}

impl<Req, Resp> AsyncCompletionBinder<Req, Resp> {
    /// Create a binder ending observations through `instrumenter`.
    pub fn new(instrumenter: Instrumenter<Req, Resp>) -> Self {
        AsyncCompletionBinder { instrumenter }
    }

    /// The instrumenter observations are ended with.
    pub fn instrumenter(&self) -> &Instrumenter<Req, Resp> {
        &self.instrumenter
    }

    /// Wraps `future`, the pending result of the operation observed in
    /// `cx`, so that the observation ends when it completes.
    ///
    /// `cx` is the context returned by [`Instrumenter::start`]. When it
    /// holds no observation the future is passed through untouched.
    ///
    /// ```
    /// use opentelemetry_instrumentation::binder::AsyncCompletionBinder;
    /// use opentelemetry_instrumentation::testing::InMemoryRecorder;
    /// use opentelemetry_instrumentation::{Context, Instrumenter, Outcome};
    ///
    /// let recorder = InMemoryRecorder::default();
    /// let instrumenter: Instrumenter<u8, u8> = Instrumenter::builder("demo", |_: &u8| "double".to_string())
    ///     .set_recorder(recorder.clone())
    ///     .set_enabled(true)
    ///     .build();
    /// let binder = AsyncCompletionBinder::new(instrumenter.clone());
    ///
    /// let (cx, _observation) = instrumenter.start(&Context::new(), &21);
    /// let bound = binder.bind(async { Ok::<_, std::io::Error>(42) }, cx, 21);
    /// assert_eq!(futures_executor::block_on(bound).unwrap(), 42);
    /// assert_eq!(recorder.finished_observations()[0].outcome, Outcome::Success);
    /// ```
    pub fn bind<F, E>(&self, future: F, cx: Context, request: Req) -> Instrumented<F, Req, Resp>
    where
        F: Future<Output = Result<Resp, E>>,
        E: Error + 'static,
    {
        let pending = cx.active_observation().is_some().then(|| PendingEnd {
            instrumenter: self.instrumenter.clone(),
            cx,
            request,
            ended: false,
        });
        Instrumented {
            inner: future,
            pending,
        }
    }

    /// Ends the observation in `cx` with an already settled `result` and
    /// returns it unchanged.
    pub fn bind_settled<E>(&self, result: Result<Resp, E>, cx: &Context, request: &Req) -> Result<Resp, E>
    where
        E: Error + 'static,
    {
        if cx.active_observation().is_some() {
            end_with_result(&self.instrumenter, cx, request, &result);
        }
        result
    }
}

fn end_with_result<Req, Resp, E>(
    instrumenter: &Instrumenter<Req, Resp>,
    cx: &Context,
    request: &Req,
    result: &Result<Resp, E>,
) where
    E: Error + 'static,
{
    match result {
        Ok(response) => instrumenter.end(cx, request, Some(response), None),
        Err(error) if is_cancellation(error) => instrumenter.end_cancelled(cx, request),
        Err(error) => instrumenter.end_with_error(cx, request, None, error),
    }
}

/// Whether `error`, or one of its sources, is a dropped oneshot sender.
fn is_cancellation(error: &(dyn Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(error) = current {
        if error.is::<Canceled>() {
            return true;
        }
        current = error.source();
    }
    false
}

/// Ends the observation as cancelled unless completed first.
struct PendingEnd<Req, Resp> {
    instrumenter: Instrumenter<Req, Resp>,
    cx: Context,
    request: Req,
    ended: bool,
}

impl<Req, Resp> PendingEnd<Req, Resp> {
    fn complete<E>(mut self, result: &Result<Resp, E>)
    where
        E: Error + 'static,
    {
        self.ended = true;
        end_with_result(&self.instrumenter, &self.cx, &self.request, result);
    }
}

impl<Req, Resp> Drop for PendingEnd<Req, Resp> {
    fn drop(&mut self) {
        if !self.ended {
            self.instrumenter.end_cancelled(&self.cx, &self.request);
        }
    }
}

pin_project! {
    /// A future ending an observation when it completes or is dropped.
    ///
    /// Returned by [`AsyncCompletionBinder::bind`]; yields exactly the
    /// output of the wrapped future.
    pub struct Instrumented<F, Req, Resp> {
        #[pin]
        inner: F,
        pending: Option<PendingEnd<Req, Resp>>,
    }
}

impl<F, Req, Resp> fmt::Debug for Instrumented<F, Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumented")
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl<F, Req, Resp, E> Future for Instrumented<F, Req, Resp>
where
    F: Future<Output = Result<Resp, E>>,
    E: Error + 'static,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = match this.inner.poll(task_cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        if let Some(pending) = this.pending.take() {
            pending.complete(&result);
        }
        Poll::Ready(result)
    }
}
