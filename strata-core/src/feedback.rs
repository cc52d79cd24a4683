//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, StrataError};

/// Cancellation state shared between the engine and whoever may cancel it.
///
/// Once locked, further `cancel()` calls are ignored. The engine locks the flag
/// right before committing.
#[derive(Debug, Default)]
pub struct CancellationFlag {
    cancelled: AtomicBool,
    locked: AtomicBool,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation. Returns false if the flag is already locked.
    pub fn cancel(&self) -> bool {
        if self.locked.load(Ordering::SeqCst) {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        true
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Reopen the commit latch. A pending cancellation stays pending.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.locked.store(false, Ordering::SeqCst);
    }
}

/// Sink for engine progress, polled for cancellation before each step.
pub trait Feedback: Send + Sync {
    fn report_progress(&self, message: &str, current: usize, total: usize);

    fn cancellation(&self) -> &CancellationFlag;

    fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }

    fn cancel(&self) {
        if !self.cancellation().cancel() {
            tracing::warn!("Cancellation ignored: the operation is already committing");
        }
    }

    /// Clear both a pending cancellation and the commit latch.
    fn reset(&self) {
        self.cancellation().reset();
    }

    /// Reopen the commit latch at the start of a run, keeping any pending cancellation.
    fn unlock_cancellation(&self) {
        self.cancellation().unlock();
    }

    /// Make cancellation ineffective from now on.
    fn lock_cancellation(&self) {
        self.cancellation().lock();
    }
}

/// Reports progress through `tracing` at info level.
#[derive(Debug, Default)]
pub struct LogFeedback {
    flag: CancellationFlag,
}

impl LogFeedback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feedback for LogFeedback {
    fn report_progress(&self, message: &str, current: usize, total: usize) {
        tracing::info!("[{}/{}] {}", current, total, message);
    }

    fn cancellation(&self) -> &CancellationFlag {
        &self.flag
    }
}

/// Discards progress; cancellation still works.
#[derive(Debug, Default)]
pub struct SilentFeedback {
    flag: CancellationFlag,
}

impl SilentFeedback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feedback for SilentFeedback {
    fn report_progress(&self, _message: &str, _current: usize, _total: usize) {}

    fn cancellation(&self) -> &CancellationFlag {
        &self.flag
    }
}

/// Step counter for one engine run.
pub struct Progress<'a> {
    feedback: &'a dyn Feedback,
    current: usize,
    total: usize,
}

impl<'a> Progress<'a> {
    pub fn new(feedback: &'a dyn Feedback, total: usize) -> Self {
        Self {
            feedback,
            current: 0,
            total,
        }
    }

    /// Check for cancellation, then count and report one step.
    pub fn step(&mut self, message: &str) -> Result<()> {
        self.check_cancelled()?;
        self.current += 1;
        self.feedback
            .report_progress(message, self.current, self.total.max(self.current));
        Ok(())
    }

    /// Report a message without counting a step.
    pub fn note(&self, message: &str) -> Result<()> {
        self.check_cancelled()?;
        self.feedback
            .report_progress(message, self.current, self.total.max(self.current));
        Ok(())
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.feedback.is_cancelled() {
            return Err(StrataError::Cancelled(format!(
                "stopped after {} of {} steps",
                self.current, self.total
            )));
        }
        Ok(())
    }

    pub fn completed(&self) -> usize {
        self.current
    }

    pub fn feedback(&self) -> &'a dyn Feedback {
        self.feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        flag: CancellationFlag,
        messages: Mutex<Vec<(String, usize, usize)>>,
    }

    impl Feedback for Recorder {
        fn report_progress(&self, message: &str, current: usize, total: usize) {
            self.messages
                .lock()
                .unwrap()
                .push((message.to_string(), current, total));
        }

        fn cancellation(&self) -> &CancellationFlag {
            &self.flag
        }
    }

    #[test]
    fn test_cancel_and_reset() {
        let feedback = SilentFeedback::new();
        assert!(!feedback.is_cancelled());
        feedback.cancel();
        assert!(feedback.is_cancelled());
        feedback.reset();
        assert!(!feedback.is_cancelled());
    }

    #[test]
    fn test_unlock_keeps_pending_cancel() {
        let feedback = SilentFeedback::new();
        feedback.cancel();
        feedback.lock_cancellation();
        feedback.unlock_cancellation();
        assert!(feedback.is_cancelled());
        assert!(!feedback.cancellation().is_locked());

        let progress = Progress::new(&feedback, 1);
        assert!(matches!(
            progress.check_cancelled(),
            Err(StrataError::Cancelled(_))
        ));
    }

    #[test]
    fn test_lock_makes_cancel_ineffective() {
        let feedback = LogFeedback::new();
        feedback.lock_cancellation();
        feedback.cancel();
        assert!(!feedback.is_cancelled());
        assert!(feedback.cancellation().is_locked());
    }

    #[test]
    fn test_progress_counts_steps() {
        let recorder = Recorder::default();
        let mut progress = Progress::new(&recorder, 3);
        progress.step("one").unwrap();
        progress.step("two").unwrap();
        assert_eq!(progress.completed(), 2);

        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages[0], ("one".to_string(), 1, 3));
        assert_eq!(messages[1], ("two".to_string(), 2, 3));
    }

    #[test]
    fn test_progress_stops_when_cancelled() {
        let recorder = Recorder::default();
        let mut progress = Progress::new(&recorder, 5);
        progress.step("one").unwrap();
        recorder.cancel();
        let err = progress.step("two").unwrap_err();
        assert!(matches!(err, StrataError::Cancelled(_)));
        assert_eq!(progress.completed(), 1);
    }
}
