//! Session-handle instrumentation.
//!
//! A session handed out by a [`SessionFactory`] is observed from the moment
//! it is opened until it is closed: one [`SpanKind::Internal`] observation
//! named `session` covers its whole lifetime, and operations performed
//! through the session are recorded as its children.
//!
//! The session type is foreign: it is not modified and holds no reference to
//! its observation. The observation's context is attached to the session
//! handle through a [`ContextStore`] keyed by the handle's identity, so it
//! lives exactly as long as the handle. A session dropped without being
//! closed ends its observation as abandoned once its entry is cleaned up.
//!
//! ```
//! use opentelemetry_instrumentation::testing::InMemoryRecorder;
//! use opentelemetry_instrumentation_session::{InstrumentedSessionFactory, SessionFactory};
//! use std::sync::Arc;
//!
//! struct Session;
//! struct Factory;
//!
//! impl SessionFactory for Factory {
//!     type Session = Session;
//!
//!     fn open_session(&self) -> Arc<Session> {
//!         Arc::new(Session)
//!     }
//!
//!     fn open_stateless_session(&self) -> Arc<Session> {
//!         Arc::new(Session)
//!     }
//! }
//!
//! let recorder = InMemoryRecorder::default();
//! let factory = InstrumentedSessionFactory::builder(Factory)
//!     .set_recorder(Arc::new(recorder.clone()))
//!     .set_enabled(true)
//!     .build();
//!
//! let session = factory.open_session();
//! factory
//!     .instrument_operation(&session, "flush", |_cx| Ok::<_, std::io::Error>(()))
//!     .unwrap();
//! factory.close_session(&session, None);
//!
//! let finished = recorder.finished_observations();
//! assert_eq!(finished[0].name, "flush");
//! assert_eq!(finished[1].name, "session");
//! ```
//!
//! [`SpanKind::Internal`]: opentelemetry_instrumentation::trace::SpanKind::Internal
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use opentelemetry_instrumentation::cache::ContextStore;
use opentelemetry_instrumentation::config::InstrumentationConfig;
use opentelemetry_instrumentation::{
    otel_debug, otel_warn, Context, Instrumenter, KeyValue, ObservationRecorder,
};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Instrumentation name, as used by `OTEL_INSTRUMENTATION_SESSION_ENABLED`.
pub const INSTRUMENTATION_NAME: &str = "session";
const SESSION_SPAN_NAME: &str = "session";
const SESSION_KIND_ATTRIBUTE: &str = "session.kind";

/// Opens sessions.
pub trait SessionFactory: Send + Sync {
    /// The session handle type.
    type Session: Send + Sync + 'static;

    /// Opens a session keeping state between operations.
    fn open_session(&self) -> Arc<Self::Session>;

    /// Opens a session without state between operations.
    fn open_stateless_session(&self) -> Arc<Self::Session>;
}

/// Whether a session keeps state between operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Opened by [`SessionFactory::open_session`].
    Stateful,
    /// Opened by [`SessionFactory::open_stateless_session`].
    Stateless,
}

impl SessionKind {
    /// Value of the `session.kind` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Stateful => "stateful",
            SessionKind::Stateless => "stateless",
        }
    }
}

/// State attached to an observed session handle.
#[derive(Debug)]
pub struct SessionState {
    cx: Context,
    kind: SessionKind,
}

impl SessionState {
    /// The context of the session observation.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// How the session was opened.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

/// An operation performed through a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOperation {
    /// Name of the operation, used as the observation name.
    pub name: String,
}

/// A [`SessionFactory`] whose sessions are observed.
pub struct InstrumentedSessionFactory<F: SessionFactory> {
    inner: F,
    sessions: Instrumenter<SessionKind, ()>,
    operations: Instrumenter<SessionOperation, ()>,
    store: ContextStore<F::Session, SessionState>,
}

impl<F> fmt::Debug for InstrumentedSessionFactory<F>
where
    F: SessionFactory + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedSessionFactory")
            .field("inner", &self.inner)
            .field("sessions", &self.sessions)
            .field("store", &self.store)
            .finish()
    }
}

impl<F: SessionFactory> InstrumentedSessionFactory<F> {
    /// Builder wrapping `factory`.
    pub fn builder(factory: F) -> InstrumentedSessionFactoryBuilder<F> {
        InstrumentedSessionFactoryBuilder {
            factory,
            recorder: None,
            enabled: None,
        }
    }

    /// The wrapped factory.
    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Opens a session whose observation is a child of `parent_cx`.
    pub fn open_session_with_context(&self, parent_cx: &Context, kind: SessionKind) -> Arc<F::Session> {
        let session = match kind {
            SessionKind::Stateful => self.inner.open_session(),
            SessionKind::Stateless => self.inner.open_stateless_session(),
        };
        if !self.sessions.should_start(parent_cx, &kind) {
            return session;
        }

        // The store computes at most once per handle: a factory handing out
        // the same handle twice keeps the first observation.
        let attached = self.store.compute_if_absent(&session, |_| {
            let (cx, _) = self.sessions.start(parent_cx, &kind);
            SessionState { cx, kind }
        });
        if let Err(err) = attached {
            otel_warn!(
                name: "InstrumentedSessionFactory.AttachFailed",
                error = err.to_string(),
            );
        }
        session
    }

    /// Ends the observation of `session`, as a failure when `error` is set.
    ///
    /// Closing the session itself is left to the caller. Returns `false`
    /// when `session` is not observed or was already closed.
    pub fn close_session(&self, session: &Arc<F::Session>, error: Option<&(dyn Error + 'static)>) -> bool {
        let Some(state) = self.store.remove(session) else {
            otel_debug!(name: "InstrumentedSessionFactory.CloseUnobserved");
            return false;
        };
        self.sessions.end(&state.cx, &state.kind, Some(&()), error);
        true
    }

    /// The context to hand to operations nested in `session`, `None` when
    /// the session is not observed.
    pub fn session_context(&self, session: &Arc<F::Session>) -> Option<Context> {
        self.store.get(session).map(|state| state.cx.clone())
    }

    /// Runs `f` as an operation of `session`, recorded as a child of the
    /// session observation.
    ///
    /// `f` receives the context of the operation. Its result is returned
    /// unchanged. Operations of an unobserved session are recorded as roots.
    pub fn instrument_operation<T, E, Op>(
        &self,
        session: &Arc<F::Session>,
        name: impl Into<String>,
        f: Op,
    ) -> Result<T, E>
    where
        E: Error + 'static,
        Op: FnOnce(&Context) -> Result<T, E>,
    {
        let parent_cx = self.session_context(session).unwrap_or_default();
        let operation = SessionOperation { name: name.into() };
        if !self.operations.should_start(&parent_cx, &operation) {
            return f(&parent_cx);
        }

        let (cx, _) = self.operations.start(&parent_cx, &operation);
        let result = f(&cx);
        match &result {
            Ok(_) => self.operations.end(&cx, &operation, Some(&()), None),
            Err(err) => self.operations.end_with_error(&cx, &operation, None, err),
        }
        result
    }

    /// Number of live sessions being observed.
    pub fn open_sessions(&self) -> usize {
        self.store.len()
    }

    /// Ends, as abandoned, the observations of sessions dropped without
    /// being closed.
    pub fn clean_up(&self) {
        self.store.clean_up()
    }
}

impl<F: SessionFactory> SessionFactory for InstrumentedSessionFactory<F> {
    type Session = F::Session;

    fn open_session(&self) -> Arc<F::Session> {
        self.open_session_with_context(&Context::new(), SessionKind::Stateful)
    }

    fn open_stateless_session(&self) -> Arc<F::Session> {
        self.open_session_with_context(&Context::new(), SessionKind::Stateless)
    }
}

/// Builder for [`InstrumentedSessionFactory`].
pub struct InstrumentedSessionFactoryBuilder<F> {
    factory: F,
    recorder: Option<Arc<dyn ObservationRecorder>>,
    enabled: Option<bool>,
}

impl<F: fmt::Debug> fmt::Debug for InstrumentedSessionFactoryBuilder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedSessionFactoryBuilder")
            .field("factory", &self.factory)
            .field("recorder", &self.recorder)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<F: SessionFactory> InstrumentedSessionFactoryBuilder<F> {
    /// Recorder receiving session and operation observations.
    pub fn set_recorder(mut self, recorder: Arc<dyn ObservationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Enables or disables the instrumentation, overriding the environment.
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Takes enablement from `config`.
    pub fn set_config(self, config: &InstrumentationConfig) -> Self {
        let enabled = config.is_enabled(INSTRUMENTATION_NAME);
        self.set_enabled(enabled)
    }

    /// Builds the instrumented factory.
    pub fn build(self) -> InstrumentedSessionFactory<F> {
        let enabled = self
            .enabled
            .unwrap_or_else(|| InstrumentationConfig::default().is_enabled(INSTRUMENTATION_NAME));

        let mut sessions = Instrumenter::<SessionKind, ()>::builder(INSTRUMENTATION_NAME, |_: &SessionKind| {
            SESSION_SPAN_NAME.to_string()
        })
        .add_attributes_extractor(
            |attributes: &mut Vec<KeyValue>, _cx: &Context, kind: &SessionKind| {
                attributes.push(KeyValue::new(SESSION_KIND_ATTRIBUTE, kind.as_str()));
            },
        )
        .set_enabled(enabled);
        let mut operations = Instrumenter::<SessionOperation, ()>::builder(INSTRUMENTATION_NAME, |operation: &SessionOperation| {
            operation.name.clone()
        })
        .set_enabled(enabled);
        if let Some(recorder) = self.recorder {
            sessions = sessions.set_shared_recorder(Arc::clone(&recorder));
            operations = operations.set_shared_recorder(recorder);
        }

        InstrumentedSessionFactory {
            inner: self.factory,
            sessions: sessions.build(),
            operations: operations.build(),
            store: ContextStore::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_instrumentation::testing::InMemoryRecorder;
    use opentelemetry_instrumentation::{ErrorKind, Outcome, Value};
    use rstest::rstest;

    #[derive(Debug)]
    struct Session;

    #[derive(Debug, Default)]
    struct Factory;

    impl SessionFactory for Factory {
        type Session = Session;

        fn open_session(&self) -> Arc<Session> {
            Arc::new(Session)
        }

        fn open_stateless_session(&self) -> Arc<Session> {
            Arc::new(Session)
        }
    }

    fn factory(recorder: &InMemoryRecorder) -> InstrumentedSessionFactory<Factory> {
        InstrumentedSessionFactory::builder(Factory)
            .set_recorder(Arc::new(recorder.clone()))
            .set_enabled(true)
            .build()
    }

    #[rstest]
    #[case(SessionKind::Stateful, "stateful")]
    #[case(SessionKind::Stateless, "stateless")]
    fn session_observed_until_closed(#[case] kind: SessionKind, #[case] attribute: &'static str) {
        let recorder = InMemoryRecorder::default();
        let factory = factory(&recorder);

        let session = factory.open_session_with_context(&Context::new(), kind);
        assert_eq!(factory.open_sessions(), 1);
        assert_eq!(recorder.started_observations().len(), 1);
        assert!(recorder.finished_observations().is_empty());

        assert!(factory.close_session(&session, None));
        let finished = recorder.finished_observations();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, SESSION_SPAN_NAME);
        assert_eq!(finished[0].outcome, Outcome::Success);
        assert_eq!(finished[0].attribute(SESSION_KIND_ATTRIBUTE), Some(&Value::from(attribute)));
        assert_eq!(factory.open_sessions(), 0);
    }

    #[test]
    fn second_close_is_ignored() {
        let recorder = InMemoryRecorder::default();
        let factory = factory(&recorder);
        let session = factory.open_session();

        assert!(factory.close_session(&session, None));
        assert!(!factory.close_session(&session, None));
        assert_eq!(recorder.finished_observations().len(), 1);
    }

    #[test]
    fn close_with_error_fails() {
        let recorder = InMemoryRecorder::default();
        let factory = factory(&recorder);
        let session = factory.open_session();

        let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection lost");
        factory.close_session(&session, Some(&error));

        let finished = recorder.finished_observations();
        assert_eq!(finished[0].outcome, Outcome::Failure);
        assert_eq!(
            finished[0].error.as_ref().map(|e| e.message.as_str()),
            Some("connection lost")
        );
    }

    #[test]
    fn operations_are_children_of_the_session() {
        let recorder = InMemoryRecorder::default();
        let factory = factory(&recorder);
        let session = factory.open_session();
        let session_cx = factory.session_context(&session).unwrap();
        let session_id = session_cx.active_observation().unwrap().span_context().span_id();

        let count = factory
            .instrument_operation(&session, "query", |_cx| Ok::<_, std::io::Error>(3))
            .unwrap();
        assert_eq!(count, 3);
        let err = factory
            .instrument_operation(&session, "flush", |_cx| {
                Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "flush failed"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "flush failed");
        factory.close_session(&session, None);

        let finished = recorder.finished_observations();
        assert_eq!(finished.len(), 3);
        assert_eq!(finished[0].name, "query");
        assert_eq!(finished[0].parent_span_id, session_id);
        assert_eq!(finished[0].outcome, Outcome::Success);
        assert_eq!(finished[1].name, "flush");
        assert_eq!(finished[1].outcome, Outcome::Failure);
        assert_eq!(
            finished[1].error.as_ref().map(|e| e.type_name.as_ref()),
            Some(std::any::type_name::<std::io::Error>())
        );
        assert_eq!(finished[2].name, SESSION_SPAN_NAME);
    }

    #[test]
    fn dropped_session_is_abandoned_on_clean_up() {
        let recorder = InMemoryRecorder::default();
        let factory = factory(&recorder);
        let session = factory.open_stateless_session();
        drop(session);

        assert_eq!(factory.open_sessions(), 0);
        assert!(recorder.finished_observations().is_empty());
        factory.clean_up();

        let finished = recorder.finished_observations();
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Abandoned)
        );
    }

    #[test]
    fn disabled_factory_observes_nothing() {
        let recorder = InMemoryRecorder::default();
        let factory = InstrumentedSessionFactory::builder(Factory)
            .set_recorder(Arc::new(recorder.clone()))
            .set_config(&InstrumentationConfig::builder().with_disabled(true).build())
            .build();

        let session = factory.open_session();
        assert!(factory.session_context(&session).is_none());
        let value = factory
            .instrument_operation(&session, "query", |cx| {
                Ok::<_, std::io::Error>(cx.active_observation().is_none())
            })
            .unwrap();
        assert!(value);
        assert!(!factory.close_session(&session, None));
        assert!(recorder.started_observations().is_empty());
    }

    #[test]
    fn disabled_through_environment() {
        temp_env::with_var("OTEL_INSTRUMENTATION_SESSION_ENABLED", Some("false"), || {
            let factory = InstrumentedSessionFactory::builder(Factory).build();
            let session = factory.open_session();
            assert!(factory.session_context(&session).is_none());
        });
    }
}
