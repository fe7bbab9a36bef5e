//! Generic middleware composition.
//!
//! One pattern serves all five middleware kinds: an ordered stack wrapped
//! around a terminal action, composed so the first middleware in the list
//! runs first and sees the effects of everything downstream when the call
//! returns. A middleware that does not call `next` short-circuits the rest
//! of the stack and the terminal action.

use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Middleware<C: Send>: Send + Sync {
    fn name(&self) -> &str {
        "middleware"
    }

    async fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> Result<(), EngineError>;
}

/// The innermost action of a pipeline (the actual LLM call, the actual tool
/// invocation, or a no-op for check-only pipelines).
#[async_trait]
pub trait TerminalAction<C: Send>: Send + Sync {
    async fn run(&self, ctx: &mut C) -> Result<(), EngineError>;
}

/// Terminal that does nothing; used for pipelines whose effect is entirely
/// in the middleware (permission checks, turn-end hooks).
pub struct NoopTerminal;

#[async_trait]
impl<C: Send> TerminalAction<C> for NoopTerminal {
    async fn run(&self, _ctx: &mut C) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Continuation handle given to each middleware; consuming it runs the rest
/// of the stack and finally the terminal action.
pub struct Next<'a, C: Send> {
    rest: &'a [Arc<dyn Middleware<C>>],
    terminal: &'a dyn TerminalAction<C>,
}

impl<'a, C: Send> Next<'a, C> {
    pub async fn run(self, ctx: &mut C) -> Result<(), EngineError> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                head.invoke(
                    ctx,
                    Next {
                        rest: tail,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.run(ctx).await,
        }
    }
}

/// An ordered middleware stack for one context type.
pub struct Pipeline<C: Send> {
    stack: Vec<Arc<dyn Middleware<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(stack: Vec<Arc<dyn Middleware<C>>>) -> Self {
        Self { stack }
    }

    pub fn empty() -> Self {
        Self { stack: Vec::new() }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware<C>>) {
        self.stack.push(middleware);
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub async fn run(
        &self,
        ctx: &mut C,
        terminal: &dyn TerminalAction<C>,
    ) -> Result<(), EngineError> {
        Next {
            rest: &self.stack,
            terminal,
        }
        .run(ctx)
        .await
    }
}

impl<C: Send> Default for Pipeline<C> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Trace {
        log: Arc<Mutex<Vec<String>>>,
    }

    struct Recorder {
        tag: &'static str,
        call_next: bool,
    }

    #[async_trait]
    impl Middleware<Trace> for Recorder {
        async fn invoke(&self, ctx: &mut Trace, next: Next<'_, Trace>) -> Result<(), EngineError> {
            ctx.log.lock().push(format!("{}:before", self.tag));
            if self.call_next {
                next.run(ctx).await?;
            }
            ctx.log.lock().push(format!("{}:after", self.tag));
            Ok(())
        }
    }

    struct LogTerminal;

    #[async_trait]
    impl TerminalAction<Trace> for LogTerminal {
        async fn run(&self, ctx: &mut Trace) -> Result<(), EngineError> {
            ctx.log.lock().push("terminal".to_string());
            Ok(())
        }
    }

    fn trace() -> (Trace, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Trace { log: log.clone() }, log)
    }

    #[tokio::test]
    async fn first_middleware_wraps_outermost() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Recorder {
                tag: "a",
                call_next: true,
            }) as Arc<dyn Middleware<Trace>>,
            Arc::new(Recorder {
                tag: "b",
                call_next: true,
            }),
        ]);
        let (mut ctx, log) = trace();
        pipeline.run(&mut ctx, &LogTerminal).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "terminal", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn skipping_next_short_circuits_downstream_and_terminal() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Recorder {
                tag: "a",
                call_next: true,
            }) as Arc<dyn Middleware<Trace>>,
            Arc::new(Recorder {
                tag: "stop",
                call_next: false,
            }),
            Arc::new(Recorder {
                tag: "never",
                call_next: true,
            }),
        ]);
        let (mut ctx, log) = trace();
        pipeline.run(&mut ctx, &LogTerminal).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["a:before", "stop:before", "stop:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn empty_pipeline_runs_just_the_terminal() {
        let pipeline: Pipeline<Trace> = Pipeline::empty();
        let (mut ctx, log) = trace();
        pipeline.run(&mut ctx, &LogTerminal).await.unwrap();
        assert_eq!(*log.lock(), vec!["terminal"]);
    }

    struct Failing;

    #[async_trait]
    impl Middleware<Trace> for Failing {
        async fn invoke(
            &self,
            _ctx: &mut Trace,
            _next: Next<'_, Trace>,
        ) -> Result<(), EngineError> {
            Err(EngineError::Middleware("boom".into()))
        }
    }

    #[tokio::test]
    async fn middleware_errors_propagate() {
        let pipeline = Pipeline::new(vec![Arc::new(Failing) as Arc<dyn Middleware<Trace>>]);
        let (mut ctx, _log) = trace();
        let err = pipeline.run(&mut ctx, &LogTerminal).await.unwrap_err();
        assert!(matches!(err, EngineError::Middleware(_)));
    }
}
