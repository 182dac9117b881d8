//! Request-scoped context propagation.
//!
//! # Design
//! - Keeps the outbound request identifier and its human-readable label in
//!   task-local storage so nested spans and error messages can reach them.
//! - Every network call made by the transport adapter runs inside one scope.

use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;

/// Retrieve the request identifier of the surrounding scope, if any.
#[must_use]
pub fn current_request_id() -> Option<String> {
    ACTIVE_REQUEST_CONTEXT
        .try_with(|ctx| ctx.request_id.as_ref().to_string())
        .ok()
}

/// Retrieve the request label of the surrounding scope, if one was supplied.
#[must_use]
pub fn current_request_label() -> Option<String> {
    ACTIVE_REQUEST_CONTEXT
        .try_with(|ctx| ctx.label.as_deref().map(str::to_string))
        .ok()
        .flatten()
}

/// Execute the provided future with the supplied request context available to downstream code.
pub async fn with_request_context<Fut, T>(
    request_id: impl Into<String>,
    label: Option<String>,
    fut: Fut,
) -> T
where
    Fut: Future<Output = T>,
{
    let context = RequestContext {
        request_id: Arc::from(request_id.into()),
        label: label.map(Arc::from),
    };
    let span = tracing::debug_span!(
        "request",
        request_id = %context.request_id,
        label = context.label.as_deref().unwrap_or_default()
    );
    ACTIVE_REQUEST_CONTEXT
        .scope(context, fut.instrument(span))
        .await
}

#[derive(Clone)]
struct RequestContext {
    request_id: Arc<str>,
    label: Option<Arc<str>>,
}

tokio::task_local! {
    static ACTIVE_REQUEST_CONTEXT: RequestContext;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_request_context_exposes_identifiers() {
        let output = with_request_context("req-42", Some("Load items".into()), async {
            assert_eq!(current_request_id().as_deref(), Some("req-42"));
            assert_eq!(current_request_label().as_deref(), Some("Load items"));
            "done"
        })
        .await;
        assert_eq!(output, "done");
        assert!(current_request_id().is_none());
        assert!(current_request_label().is_none());
    }

    #[tokio::test]
    async fn missing_label_reads_as_none() {
        with_request_context("req-7", None, async {
            assert_eq!(current_request_id().as_deref(), Some("req-7"));
            assert!(current_request_label().is_none());
        })
        .await;
    }
}
