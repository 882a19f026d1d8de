//! Task-scoped profiling labels.
//!
//! Labels are installed for the duration of a future with [`with_labels`]
//! and are visible through [`current`] from anywhere inside that task while
//! the future is being polled. They are removed as soon as the future
//! returns, is dropped, or yields back to the scheduler, so activity from
//! other calls sharing the worker thread is never mislabelled.
//!
//! [`current`] is the read side for anything attributing work to a call: the
//! access log records the labels, and a sampling profiler integration reads
//! them from the same place.

use std::future::Future;

use keel_core::ProfilingLabels;

tokio::task_local! {
    static LABELS: ProfilingLabels;
}

/// Runs `fut` with `labels` attached to the current task.
pub async fn with_labels<F: Future>(labels: ProfilingLabels, fut: F) -> F::Output {
    LABELS.scope(labels, fut).await
}

/// Labels of the call currently executing on this task, if any.
#[must_use]
pub fn current() -> Option<ProfilingLabels> {
    LABELS.try_with(Clone::clone).ok()
}
