//! Bounded worker pool that fans a list of work items out to a per-item
//! function and reports aggregate progress to a [`StatusSink`].

use crate::status::StatusSink;
use crate::Result;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub const FALLBACK_WORKER_COUNT: usize = 4;
pub const BATCH_COMPLETE_MESSAGE: &str = "Playlist download completed!";

/// One unit of work: a single media URL.
pub type WorkItem = String;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Succeeded,
    Failed,
    /// The per-item function returned an error or panicked, or the worker
    /// holding the item died.
    Faulted,
    /// Never dispatched because the batch was canceled first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub item: WorkItem,
    pub state: ItemState,
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn success(&self) -> bool {
        self.state == ItemState::Succeeded
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub total: usize,
    pub completed: usize,
    pub workers: usize,
    pub canceled: bool,
    /// In submission order.
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn count(&self, state: ItemState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(ItemState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(ItemState::Failed)
    }

    pub fn faulted(&self) -> usize {
        self.count(ItemState::Faulted)
    }

    pub fn skipped(&self) -> usize {
        self.count(ItemState::Skipped)
    }
}

/// One worker per available CPU, or [`FALLBACK_WORKER_COUNT`] when that
/// cannot be determined.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKER_COUNT)
}

#[derive(Debug, Clone, Default)]
pub struct BatchRunner {
    workers: Option<usize>,
    cancel: Option<CancelToken>,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count).max(1)
    }

    /// Runs `per_item` once for every item, at most `worker_count()` at a
    /// time, and blocks until every dispatched item has finished.
    ///
    /// `per_item` returns `Ok(true)` on success and `Ok(false)` on an
    /// ordinary failure. An `Err` or a panic is recorded as a fault for that
    /// item only; the rest of the batch keeps going.
    pub fn run<F>(
        &self,
        items: &[WorkItem],
        destination: &Path,
        per_item: F,
        sink: &StatusSink,
    ) -> BatchReport
    where
        F: Fn(&str, &Path, &StatusSink) -> Result<bool> + Sync,
    {
        let total = items.len();
        let workers = self.worker_count();
        sink.send(format!("Found {total} items. Using {workers} threads..."));
        tracing::info!(total, workers, destination = %destination.display(), "batch started");

        let next = AtomicUsize::new(0);
        let completed = Mutex::new(0_usize);
        let slots: Mutex<Vec<Option<ItemOutcome>>> = Mutex::new((0..total).map(|_| None).collect());

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers.min(total))
                .map(|_| {
                    let ctx = WorkerCtx {
                        items,
                        destination,
                        sink,
                        next: &next,
                        completed: &completed,
                        slots: &slots,
                        cancel: self.cancel.as_ref(),
                    };
                    let per_item = &per_item;
                    scope.spawn(move || ctx.run(per_item))
                })
                .collect();

            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("batch worker thread panicked");
                }
            }
        });

        let canceled = self.cancel.as_ref().is_some_and(CancelToken::is_canceled);
        let claimed = next.into_inner().min(total);
        let slots = slots.into_inner().unwrap_or_else(|e| e.into_inner());
        let outcomes: Vec<ItemOutcome> = slots
            .into_iter()
            .zip(items)
            .enumerate()
            .map(|(idx, (slot, item))| {
                slot.unwrap_or_else(|| unfinished_outcome(item, idx < claimed, canceled))
            })
            .collect();

        let completed = completed.into_inner().unwrap_or_else(|e| e.into_inner());
        let canceled = canceled && outcomes.iter().any(|o| o.state == ItemState::Skipped);
        if canceled {
            sink.send(format!(
                "Playlist download canceled ({completed}/{total} finished)."
            ));
        } else {
            sink.send(BATCH_COMPLETE_MESSAGE);
        }
        tracing::info!(total, completed, canceled, "batch finished");

        BatchReport {
            total,
            completed,
            workers,
            canceled,
            outcomes,
        }
    }
}

/// Runs a batch with one worker per CPU and no cancel signal.
pub fn run_batch<F>(
    items: &[WorkItem],
    destination: &Path,
    per_item: F,
    sink: &StatusSink,
) -> BatchReport
where
    F: Fn(&str, &Path, &StatusSink) -> Result<bool> + Sync,
{
    BatchRunner::new().run(items, destination, per_item, sink)
}

/// Outcome for an item that has no recorded result: either it was never
/// dispatched because of a cancel, or the worker holding it died.
fn unfinished_outcome(item: &str, claimed: bool, canceled: bool) -> ItemOutcome {
    if canceled && !claimed {
        ItemOutcome {
            item: item.to_string(),
            state: ItemState::Skipped,
            message: Some("not started: batch canceled".to_string()),
        }
    } else {
        ItemOutcome {
            item: item.to_string(),
            state: ItemState::Faulted,
            message: Some("batch worker thread panicked".to_string()),
        }
    }
}

struct WorkerCtx<'a> {
    items: &'a [WorkItem],
    destination: &'a Path,
    sink: &'a StatusSink,
    next: &'a AtomicUsize,
    completed: &'a Mutex<usize>,
    slots: &'a Mutex<Vec<Option<ItemOutcome>>>,
    cancel: Option<&'a CancelToken>,
}

impl WorkerCtx<'_> {
    fn run<F>(&self, per_item: &F)
    where
        F: Fn(&str, &Path, &StatusSink) -> Result<bool> + Sync,
    {
        let total = self.items.len();
        loop {
            if self.cancel.is_some_and(CancelToken::is_canceled) {
                break;
            }
            let idx = self.next.fetch_add(1, Ordering::SeqCst);
            if idx >= total {
                break;
            }

            let item = &self.items[idx];
            let outcome = self.run_one(per_item, item);
            self.slots.lock().unwrap_or_else(|e| e.into_inner())[idx] = Some(outcome);

            {
                let mut completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
                *completed += 1;
                self.sink
                    .send(format!("Downloaded {}/{}", *completed, total));
            }
        }
    }

    fn run_one<F>(&self, per_item: &F, item: &str) -> ItemOutcome
    where
        F: Fn(&str, &Path, &StatusSink) -> Result<bool> + Sync,
    {
        tracing::debug!(item, "item started");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            per_item(item, self.destination, self.sink)
        }));

        let (state, message) = match result {
            Ok(Ok(true)) => (ItemState::Succeeded, None),
            Ok(Ok(false)) => (ItemState::Failed, None),
            Ok(Err(err)) => (ItemState::Faulted, Some(err.to_string())),
            Err(payload) => (ItemState::Faulted, Some(panic_detail(payload.as_ref()))),
        };

        if let Some(detail) = message.as_deref() {
            tracing::warn!(item, detail, "item faulted");
            self.sink.send(format!("Exception for {item}: {detail}"));
        } else {
            tracing::debug!(item, ?state, "item finished");
        }

        ItemOutcome {
            item: item.to_string(),
            state,
            message,
        }
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use std::path::PathBuf;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    fn items(names: &[&str]) -> Vec<WorkItem> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn drain(rx: Receiver<String>) -> Vec<String> {
        rx.try_iter().collect()
    }

    fn progress_lines(messages: &[String]) -> Vec<&String> {
        messages
            .iter()
            .filter(|m| m.starts_with("Downloaded "))
            .collect()
    }

    #[test]
    fn three_items_two_workers_message_order() {
        let (sink, rx) = StatusSink::channel();
        let report = BatchRunner::new().workers(2).run(
            &items(&["a", "b", "c"]),
            Path::new("out"),
            |_, _, _| Ok(true),
            &sink,
        );
        drop(sink);
        let messages = drain(rx);

        assert_eq!(messages.first().map(String::as_str), Some("Found 3 items. Using 2 threads..."));
        assert_eq!(messages.last().map(String::as_str), Some(BATCH_COMPLETE_MESSAGE));
        assert_eq!(
            progress_lines(&messages),
            vec!["Downloaded 1/3", "Downloaded 2/3", "Downloaded 3/3"]
        );
        assert_eq!(messages.len(), 5);
        assert_eq!(report.completed, 3);
        assert_eq!(report.succeeded(), 3);
        assert!(!report.canceled);
    }

    #[test]
    fn every_item_counts_exactly_once() {
        for n in [0_usize, 1, 7, 40] {
            let list: Vec<WorkItem> = (0..n).map(|i| format!("item-{i}")).collect();
            let calls = AtomicUsize::new(0);
            let (sink, rx) = StatusSink::channel();
            let report = BatchRunner::new().workers(3).run(
                &list,
                Path::new("out"),
                |_, _, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                },
                &sink,
            );
            drop(sink);
            let messages = drain(rx);

            assert_eq!(calls.load(Ordering::SeqCst), n);
            assert_eq!(report.completed, n);
            assert_eq!(report.outcomes.len(), n);
            assert_eq!(progress_lines(&messages).len(), n);
            assert_eq!(messages.last().map(String::as_str), Some(BATCH_COMPLETE_MESSAGE));
        }
    }

    #[test]
    fn single_worker_preserves_submission_order() {
        let order = Mutex::new(Vec::new());
        let list = items(&["1", "2", "3", "4", "5"]);
        BatchRunner::new().workers(1).run(
            &list,
            Path::new("out"),
            |item, _, _| {
                order.lock().unwrap().push(item.to_string());
                Ok(true)
            },
            &StatusSink::discard(),
        );
        assert_eq!(*order.lock().unwrap(), list);
    }

    #[test]
    fn concurrency_never_exceeds_worker_count() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let list: Vec<WorkItem> = (0..12).map(|i| i.to_string()).collect();
        BatchRunner::new().workers(3).run(
            &list,
            Path::new("out"),
            |_, _, _| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(true)
            },
            &StatusSink::discard(),
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn faults_are_isolated_and_still_counted() {
        let (sink, rx) = StatusSink::channel();
        let list = items(&["x", "y", "z"]);
        let report = BatchRunner::new().workers(2).run(
            &list,
            Path::new("out"),
            |item, _, _| -> Result<bool> {
                if item == "y" {
                    return Err(EngineError::ExternalToolMissing {
                        tool: "yt-dlp".to_string(),
                    });
                }
                panic!("boom on {item}");
            },
            &sink,
        );
        drop(sink);
        let messages = drain(rx);

        assert_eq!(report.completed, 3);
        assert_eq!(report.faulted(), 3);
        assert!(messages.iter().any(|m| m == "Exception for x: boom on x"));
        assert!(messages
            .iter()
            .any(|m| m == "Exception for y: external tool is missing: yt-dlp"));
        assert_eq!(messages.last().map(String::as_str), Some(BATCH_COMPLETE_MESSAGE));
    }

    #[test]
    fn failures_do_not_block_later_items() {
        let list = items(&["bad", "good-1", "good-2"]);
        let report = BatchRunner::new().workers(1).run(
            &list,
            Path::new("out"),
            |item, _, _| Ok(item != "bad"),
            &StatusSink::discard(),
        );
        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.outcomes[0].state, ItemState::Failed);
        assert!(report.outcomes[1].success());
        assert!(report.outcomes[2].success());
    }

    #[test]
    fn destination_is_passed_through() {
        let dest = PathBuf::from("/srv/media");
        let report = BatchRunner::new().workers(2).run(
            &items(&["a", "b"]),
            &dest,
            |_, d, _| Ok(d == Path::new("/srv/media")),
            &StatusSink::discard(),
        );
        assert_eq!(report.succeeded(), 2);
    }

    #[test]
    fn cancel_before_run_skips_everything() {
        let token = CancelToken::new();
        token.cancel();
        let (sink, rx) = StatusSink::channel();
        let report = BatchRunner::new()
            .workers(2)
            .cancel_token(token)
            .run(&items(&["a", "b"]), Path::new("out"), |_, _, _| Ok(true), &sink);
        drop(sink);
        let messages = drain(rx);

        assert!(report.canceled);
        assert_eq!(report.completed, 0);
        assert_eq!(report.skipped(), 2);
        assert!(progress_lines(&messages).is_empty());
        assert_eq!(
            messages.last().map(String::as_str),
            Some("Playlist download canceled (0/2 finished).")
        );
    }

    #[test]
    fn cancel_mid_batch_lets_started_items_finish() {
        let token = CancelToken::new();
        let list = items(&["a", "b", "c", "d"]);
        let report = BatchRunner::new().workers(1).cancel_token(token.clone()).run(
            &list,
            Path::new("out"),
            |item, _, _| {
                if item == "b" {
                    token.cancel();
                }
                Ok(true)
            },
            &StatusSink::discard(),
        );
        assert!(report.canceled);
        assert_eq!(report.completed, 2);
        assert!(report.outcomes[1].success());
        assert_eq!(report.outcomes[2].state, ItemState::Skipped);
        assert_eq!(report.outcomes[3].state, ItemState::Skipped);
    }

    #[test]
    fn dead_worker_keeps_finished_items_and_is_not_a_cancel() {
        let (downstream, rx) = StatusSink::channel();
        let sink = StatusSink::from_fn(move |m| {
            if m == "Downloaded 1/3" {
                panic!("display went away");
            }
            downstream.send(m);
        });
        let report = BatchRunner::new().workers(1).cancel_token(CancelToken::new()).run(
            &items(&["a", "b", "c"]),
            Path::new("out"),
            |_, _, _| Ok(true),
            &sink,
        );
        drop(sink);
        let messages = drain(rx);

        assert!(!report.canceled);
        assert_eq!(report.skipped(), 0);
        assert!(report.outcomes[0].success());
        assert_eq!(report.outcomes[1].state, ItemState::Faulted);
        assert_eq!(report.outcomes[2].state, ItemState::Faulted);
        assert_eq!(messages.last().map(String::as_str), Some(BATCH_COMPLETE_MESSAGE));
    }

    #[test]
    fn cancel_after_last_dispatch_reports_completion() {
        let token = CancelToken::new();
        let list = items(&["a", "b"]);
        let (sink, rx) = StatusSink::channel();
        let report = BatchRunner::new().workers(1).cancel_token(token.clone()).run(
            &list,
            Path::new("out"),
            |item, _, _| {
                if item == "b" {
                    token.cancel();
                }
                Ok(true)
            },
            &sink,
        );
        drop(sink);

        assert!(!report.canceled);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(drain(rx).last().map(String::as_str), Some(BATCH_COMPLETE_MESSAGE));
    }

    #[test]
    fn worker_count_override_is_clamped() {
        assert_eq!(BatchRunner::new().workers(0).worker_count(), 1);
        assert!(BatchRunner::new().worker_count() >= 1);
    }
}
