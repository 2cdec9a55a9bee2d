//! Composable interceptor pipeline wrapping every call on both sides.
//!
//! A pipeline is an ordered list of [`Filter`]s around a [`Terminal`] action
//! (send over the wire on the client, invoke the local method on the
//! server). Composition is a right fold: the last filter wraps the terminal,
//! each preceding filter wraps the one after it. Execution therefore runs
//! filters in declaration order on the way in and reverse order on the way
//! out — classic onion semantics.
//!
//! A filter may:
//!
//! - call `next` once and return its result, modified or not,
//! - call `next` multiple times (retry),
//! - short-circuit by returning its own envelope without calling `next`,
//! - mutate headers before or after calling `next`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::envelope::Envelope;
use crate::error::RpcError;

/// The action at the end of a pipeline.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Perform the terminal action for this envelope.
    async fn call(&self, envelope: Envelope) -> Result<Envelope, RpcError>;
}

/// One step of the pipeline.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Handle the envelope, deciding whether and how often to invoke `next`.
    async fn handle(&self, envelope: Envelope, next: &Next<'_>) -> Result<Envelope, RpcError>;
}

/// Continuation handed to a filter: the rest of the chain plus the terminal.
///
/// `run` may be called any number of times; each call walks the remaining
/// filters independently.
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    /// Run the remainder of the pipeline with the given envelope.
    pub fn run(&self, envelope: Envelope) -> BoxFuture<'_, Result<Envelope, RpcError>> {
        Box::pin(async move {
            match self.filters.split_first() {
                Some((head, rest)) => {
                    let next = Next {
                        filters: rest,
                        terminal: self.terminal,
                    };
                    head.handle(envelope, &next).await
                }
                None => self.terminal.call(envelope).await,
            }
        })
    }
}

/// Execute a full pipeline: `filters` in declaration order around `terminal`.
pub async fn run_pipeline(
    filters: &[Arc<dyn Filter>],
    terminal: &dyn Terminal,
    envelope: Envelope,
) -> Result<Envelope, RpcError> {
    Next { filters, terminal }.run(envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the order in which filters and the terminal run.
    #[derive(Default)]
    struct Trace(Mutex<Vec<&'static str>>);

    impl Trace {
        fn push(&self, step: &'static str) {
            self.0.lock().expect("trace lock").push(step);
        }

        fn steps(&self) -> Vec<&'static str> {
            self.0.lock().expect("trace lock").clone()
        }
    }

    struct TracingFilter {
        name: &'static str,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl Filter for TracingFilter {
        async fn handle(&self, envelope: Envelope, next: &Next<'_>) -> Result<Envelope, RpcError> {
            self.trace.push(match self.name {
                "A" => "A.before",
                _ => "B.before",
            });
            let result = next.run(envelope).await;
            self.trace.push(match self.name {
                "A" => "A.after",
                _ => "B.after",
            });
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Filter for ShortCircuit {
        async fn handle(&self, envelope: Envelope, _next: &Next<'_>) -> Result<Envelope, RpcError> {
            Ok(Envelope::response(&envelope, b"short".to_vec()))
        }
    }

    struct EchoTerminal {
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl Terminal for EchoTerminal {
        async fn call(&self, envelope: Envelope) -> Result<Envelope, RpcError> {
            self.trace.push("T");
            Ok(Envelope::response(&envelope, envelope.payload.clone()))
        }
    }

    struct RetryTwice;

    #[async_trait]
    impl Filter for RetryTwice {
        async fn handle(&self, envelope: Envelope, next: &Next<'_>) -> Result<Envelope, RpcError> {
            let _first = next.run(envelope.clone()).await?;
            next.run(envelope).await
        }
    }

    fn request() -> Envelope {
        Envelope::request("Svc", "M", vec![1])
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let trace = Arc::new(Trace::default());
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(TracingFilter {
                name: "A",
                trace: trace.clone(),
            }),
            Arc::new(TracingFilter {
                name: "B",
                trace: trace.clone(),
            }),
        ];
        let terminal = EchoTerminal {
            trace: trace.clone(),
        };

        run_pipeline(&filters, &terminal, request())
            .await
            .expect("pipeline");

        assert_eq!(
            trace.steps(),
            vec!["A.before", "B.before", "T", "B.after", "A.after"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal_and_later_filters() {
        let trace = Arc::new(Trace::default());
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(TracingFilter {
                name: "A",
                trace: trace.clone(),
            }),
            Arc::new(ShortCircuit),
            Arc::new(TracingFilter {
                name: "B",
                trace: trace.clone(),
            }),
        ];
        let terminal = EchoTerminal {
            trace: trace.clone(),
        };

        let reply = run_pipeline(&filters, &terminal, request())
            .await
            .expect("pipeline");

        assert_eq!(reply.payload, b"short".to_vec());
        // Only A saw the call; B and the terminal never ran.
        assert_eq!(trace.steps(), vec!["A.before", "A.after"]);
    }

    #[tokio::test]
    async fn test_empty_pipeline_runs_terminal_directly() {
        let trace = Arc::new(Trace::default());
        let terminal = EchoTerminal {
            trace: trace.clone(),
        };

        let reply = run_pipeline(&[], &terminal, request()).await.expect("pipeline");
        assert_eq!(reply.payload, vec![1]);
        assert_eq!(trace.steps(), vec!["T"]);
    }

    #[tokio::test]
    async fn test_filter_may_invoke_next_multiple_times() {
        let trace = Arc::new(Trace::default());
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(RetryTwice)];
        let terminal = EchoTerminal {
            trace: trace.clone(),
        };

        run_pipeline(&filters, &terminal, request())
            .await
            .expect("pipeline");

        assert_eq!(trace.steps(), vec!["T", "T"]);
    }
}
