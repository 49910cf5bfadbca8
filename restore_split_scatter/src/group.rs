use crate::{Error, Result};
use observability_deps::tracing::debug;
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A set of tasks sharing one cancellation token, of which the first failure wins.
///
/// When any task fails, the token is cancelled so the others stop at their next blocking
/// point. [`Error::Cancelled`] returned by those is never reported over the failure that caused
/// it.
#[derive(Debug)]
pub(crate) struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Wait for every task to finish, returning the first error.
    pub(crate) async fn wait(mut self) -> Result<()> {
        let mut first: Option<Error> = None;

        while let Some(res) = self.tasks.join_next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => Error::TaskJoin(e),
            };
            self.cancel.cancel();

            first = match first {
                None => Some(err),
                Some(Error::Cancelled) if !err.is_cancelled() => Some(err),
                Some(existing) => {
                    if !err.is_cancelled() {
                        debug!(error = %err, "dropping error from split and scatter task");
                    }
                    Some(existing)
                }
            };
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run `fut`, giving up with [`Error::Cancelled`] as soon as `cancel` fires.
pub(crate) async fn or_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
    T: Send,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}
