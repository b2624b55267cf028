//! Listeners notified of every operation an instrumenter observes.
use crate::instrumenter::{ObservationData, ObservationRecorder};
use crate::{otel_warn, Context};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Notified when an operation starts and when it ends.
///
/// Listeners are registered per instrumenter with
/// [`InstrumenterBuilder::add_operation_listener`] and are meant for
/// aggregates recorded alongside the observations, such as request duration
/// metrics. They are called on the thread that starts or ends the
/// operation, before the [`ObservationRecorder`], and must not block.
/// Panics are caught and logged.
///
/// [`InstrumenterBuilder::add_operation_listener`]: crate::InstrumenterBuilder::add_operation_listener
pub trait OperationListener: Send + Sync + fmt::Debug {
    /// Called when an operation starts, with the attributes extracted so far.
    fn on_start(&self, _observation: &ObservationData, _parent_cx: &Context) {}

    /// Called exactly once per operation, after its terminal transition.
    ///
    /// Cancelled and abandoned operations are reported too.
    fn on_end(&self, observation: &ObservationData);
}

/// Fans observations out to the operation listeners, then to the recorder.
#[derive(Debug)]
pub(crate) struct ListeningRecorder {
    recorder: Arc<dyn ObservationRecorder>,
    listeners: Vec<Box<dyn OperationListener>>,
}

impl ListeningRecorder {
    pub(crate) fn new(
        recorder: Arc<dyn ObservationRecorder>,
        listeners: Vec<Box<dyn OperationListener>>,
    ) -> Self {
        ListeningRecorder {
            recorder,
            listeners,
        }
    }
}

impl ObservationRecorder for ListeningRecorder {
    fn on_start(&self, observation: &ObservationData, parent_cx: &Context) {
        for listener in &self.listeners {
            let called =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_start(observation, parent_cx)));
            if called.is_err() {
                otel_warn!(
                    name: "OperationListener.OnStartPanicked",
                    instrumentation_name = &*observation.instrumentation_name,
                );
            }
        }
        self.recorder.on_start(observation, parent_cx);
    }

    fn on_end(&self, observation: ObservationData) {
        for listener in &self.listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_end(&observation))).is_err() {
                otel_warn!(
                    name: "OperationListener.OnEndPanicked",
                    instrumentation_name = &*observation.instrumentation_name,
                );
            }
        }
        self.recorder.on_end(observation);
    }
}
