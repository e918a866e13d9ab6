//! Deciding whether a forwarded call counts as a breaker failure.
//!
//! [`DefaultClassifier`] counts every `Err` as a failure. [`StatusClassifier`]
//! also inspects successful replies: a reply fails when its transport status is
//! not OK, or when its body is a JSON object whose `status` field is not
//! [`SUCCESS_STATUS`].

use std::sync::Arc;

/// Application-level status that marks a successful reply body.
pub const SUCCESS_STATUS: u64 = 200;

/// Classifies the result of a forwarded call.
pub trait FailureClassifier<Res, Err>: Send + Sync {
    /// `true` if `result` should be recorded as a failure.
    fn is_failure(&self, result: &Result<Res, Err>) -> bool;
}

/// Treats all errors, and only errors, as failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl<Res, Err> FailureClassifier<Res, Err> for DefaultClassifier {
    fn is_failure(&self, result: &Result<Res, Err>) -> bool {
        result.is_err()
    }
}

/// A classifier backed by a closure.
#[derive(Clone)]
pub struct FnClassifier<F> {
    f: Arc<F>,
}

impl<F> FnClassifier<F> {
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F, Res, Err> FailureClassifier<Res, Err> for FnClassifier<F>
where
    F: Fn(&Result<Res, Err>) -> bool + Send + Sync,
{
    fn is_failure(&self, result: &Result<Res, Err>) -> bool {
        (self.f)(result)
    }
}

impl<F> std::fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnClassifier").field("f", &"<closure>").finish()
    }
}

/// A reply that carries a transport status and a raw body.
pub trait StatusEnvelope {
    /// Whether the transport reported success.
    fn transport_ok(&self) -> bool;
    /// Raw reply body.
    fn body(&self) -> &[u8];
}

/// Minimal HTTP-style reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, body: body.into() }
    }

    /// A `200 OK` reply.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }
}

impl StatusEnvelope for Reply {
    fn transport_ok(&self) -> bool {
        self.status == 200
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Classifier for replies that embed an application status in their body.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusClassifier;

impl<Res: StatusEnvelope, Err> FailureClassifier<Res, Err> for StatusClassifier {
    fn is_failure(&self, result: &Result<Res, Err>) -> bool {
        match result {
            Err(_) => true,
            Ok(reply) if !reply.transport_ok() => true,
            Ok(reply) => body_reports_failure(reply.body()),
        }
    }
}

/// `true` if `body` is a JSON object whose `status` is anything other than
/// [`SUCCESS_STATUS`], including a missing or `null` field. Empty bodies,
/// non-JSON bodies and JSON that is not an object pass.
pub fn body_reports_failure(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    let Ok(serde_json::Value::Object(fields)) = serde_json::from_slice(body) else {
        return false;
    };
    fields.get("status").and_then(serde_json::Value::as_u64) != Some(SUCCESS_STATUS)
}
