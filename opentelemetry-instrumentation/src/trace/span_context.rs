use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

const SAMPLED_BIT: u8 = 0x01;
const MAX_TRACE_STATE_MEMBERS: usize = 32;
const MAX_TRACE_STATE_VALUE_LEN: usize = 256;

/// Trace flags of a [`SpanContext`], as carried in the last `traceparent`
/// field.
///
/// Only the `sampled` bit is interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// Flags with only the `sampled` bit set.
    pub const SAMPLED: TraceFlags = TraceFlags(SAMPLED_BIT);

    /// Flags from their wire representation.
    pub const fn new(flags: u8) -> Self {
        TraceFlags(flags)
    }

    /// Whether the `sampled` bit is set.
    pub fn is_sampled(&self) -> bool {
        self.0 & SAMPLED_BIT == SAMPLED_BIT
    }

    /// A copy of these flags with the `sampled` bit set or cleared.
    pub fn with_sampled(&self, sampled: bool) -> Self {
        if sampled {
            TraceFlags(self.0 | SAMPLED_BIT)
        } else {
            TraceFlags(self.0 & !SAMPLED_BIT)
        }
    }

    /// The wire representation.
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident($repr:ty), $width:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name($repr);

        impl $name {
            /// The all-zero id, never assigned to an observation.
            pub const INVALID: $name = $name(0);

            /// Parses the base 16 representation of an id.
            pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
                <$repr>::from_str_radix(hex, 16).map($name)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                $name(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:0width$x}", self.0, width = $width)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

hex_id!(
    /// Identifies a trace: every observation of one causal tree shares it.
    /// Displayed as 32 lowercase hex digits.
    ///
    /// ```
    /// use opentelemetry_instrumentation::trace::TraceId;
    ///
    /// assert!(TraceId::from_hex("58406520a006649127e371903a2de979").is_ok());
    /// assert!(TraceId::from_hex("not_hex").is_err());
    /// ```
    TraceId(u128),
    32
);

hex_id!(
    /// Identifies one observation within its trace. Displayed as 16
    /// lowercase hex digits.
    SpanId(u64),
    16
);

/// Error returned when a [`TraceState`] member is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceStateError {
    /// The key is not a W3C simple or multi-tenant key.
    #[error("invalid tracestate key `{0}`")]
    Key(String),

    /// The value is empty, too long or holds a forbidden character.
    #[error("invalid tracestate value `{0}`")]
    Value(String),

    /// A list member has no `=` separator.
    #[error("invalid tracestate list member `{0}`")]
    List(String),

    /// The same key appears twice.
    #[error("duplicate tracestate key `{0}`")]
    Duplicate(String),

    /// More members than the header may carry.
    #[error("tracestate holds more than 32 members")]
    TooManyMembers,
}

/// Vendor entries carried next to the trace id in the `tracestate` header,
/// in header order.
///
/// See <https://www.w3.org/TR/trace-context/#tracestate-header>.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceState(Vec<(String, String)>);

impl TraceState {
    /// The empty trace state.
    pub const NONE: TraceState = TraceState(Vec::new());

    /// Builds a trace state from `(key, value)` members, in order.
    ///
    /// ```
    /// use opentelemetry_instrumentation::trace::TraceState;
    ///
    /// let trace_state = TraceState::from_key_value([("rojo", "00f067aa0ba902b7"), ("congo", "t61rcWkgMzE")]).unwrap();
    /// assert_eq!(trace_state.header(), "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE");
    /// assert_eq!(trace_state.get("congo"), Some("t61rcWkgMzE"));
    /// ```
    pub fn from_key_value<T, K, V>(members: T) -> Result<Self, TraceStateError>
    where
        T: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries: Vec<(String, String)> = Vec::new();
        for (key, value) in members {
            let (key, value) = (key.into(), value.into());
            if !is_valid_key(&key) {
                return Err(TraceStateError::Key(key));
            }
            if !is_valid_value(&value) {
                return Err(TraceStateError::Value(value));
            }
            if entries.iter().any(|(existing, _)| *existing == key) {
                return Err(TraceStateError::Duplicate(key));
            }
            if entries.len() == MAX_TRACE_STATE_MEMBERS {
                return Err(TraceStateError::TooManyMembers);
            }
            entries.push((key, value));
        }
        Ok(TraceState(entries))
    }

    /// The value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if there are no members.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `tracestate` header value.
    pub fn header(&self) -> String {
        let mut header = String::new();
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                header.push(',');
            }
            header.push_str(key);
            header.push('=');
            header.push_str(value);
        }
        header
    }
}

impl FromStr for TraceState {
    type Err = TraceStateError;

    /// Parses a `tracestate` header value. Blank list members are skipped.
    fn from_str(header: &str) -> Result<Self, Self::Err> {
        let members = header
            .split(',')
            .map(str::trim)
            .filter(|member| !member.is_empty())
            .map(|member| {
                member
                    .split_once('=')
                    .map(|(key, value)| (key.trim(), value.trim()))
                    .ok_or_else(|| TraceStateError::List(member.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        TraceState::from_key_value(members)
    }
}

fn is_key_char(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'*' | b'/')
}

/// `simple-key` or `tenant-id@system-id`.
fn is_valid_key(key: &str) -> bool {
    match key.split_once('@') {
        None => {
            key.len() <= 256
                && key.as_bytes().first().is_some_and(u8::is_ascii_lowercase)
                && key.bytes().all(is_key_char)
        }
        Some((tenant, system)) => {
            (1..=241).contains(&tenant.len())
                && (1..=14).contains(&system.len())
                && tenant
                    .as_bytes()
                    .first()
                    .is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && system.as_bytes().first().is_some_and(u8::is_ascii_lowercase)
                && tenant.bytes().all(is_key_char)
                && system.bytes().all(is_key_char)
        }
    }
}

/// Printable ASCII without `,` and `=`, not ending in a space.
fn is_valid_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TRACE_STATE_VALUE_LEN
        && !value.ends_with(' ')
        && value
            .bytes()
            .all(|b| (0x20..=0x7e).contains(&b) && b != b',' && b != b'=')
}

/// The propagated identity of an observation.
///
/// A span context is remote when it was extracted from a carrier rather than
/// created in this process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
    trace_flags: TraceFlags,
    is_remote: bool,
    trace_state: TraceState,
}

impl SpanContext {
    /// A span context with invalid ids.
    pub fn empty_context() -> Self {
        SpanContext {
            trace_id: TraceId::INVALID,
            span_id: SpanId::INVALID,
            trace_flags: TraceFlags::default(),
            is_remote: false,
            trace_state: TraceState::NONE,
        }
    }

    /// Create a span context.
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        trace_flags: TraceFlags,
        is_remote: bool,
        trace_state: TraceState,
    ) -> Self {
        SpanContext {
            trace_id,
            span_id,
            trace_flags,
            is_remote,
            trace_state,
        }
    }

    /// The trace id.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The span id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The trace flags.
    pub fn trace_flags(&self) -> TraceFlags {
        self.trace_flags
    }

    /// Returns `true` if both the trace id and the span id are non-zero.
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }

    /// Returns `true` if the span context was extracted from a carrier.
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Returns `true` if the `sampled` flag is set.
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// The vendor entries of the trace.
    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }
}
