use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};

/// Receives coarse progress from long-running passes.
pub trait Progress: Send + Sync {
    /// Called with a percentage in `0..=100`, never decreasing within one
    /// invocation of an engine operation.
    fn report_progress(&self, percent: u8);
}

impl<F> Progress for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report_progress(&self, percent: u8) {
        self(percent)
    }
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report_progress(&self, _percent: u8) {}
}

/// Cooperative cancellation flag shared between a runner and a pass.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Forwards progress for one invocation, mapping `0..=100` onto the
/// `[from, to]` span of the sink and dropping values that would go
/// backwards.
pub(crate) struct Milestones<'a> {
    sink: &'a dyn Progress,
    from: u8,
    to: u8,
    last: AtomicI16,
}

impl<'a> Milestones<'a> {
    pub fn new(sink: &'a dyn Progress) -> Self {
        Self::span(sink, 0, 100)
    }

    pub fn span(sink: &'a dyn Progress, from: u8, to: u8) -> Self {
        let to = to.min(100);
        Self {
            sink,
            from: from.min(to),
            to,
            last: AtomicI16::new(-1),
        }
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(100) as u32;
        let scaled = self.from as u32 + (self.to - self.from) as u32 * percent / 100;
        let scaled = scaled as i16;
        if self.last.fetch_max(scaled, Ordering::SeqCst) >= scaled {
            return;
        }
        self.sink.report_progress(scaled as u8);
    }

    /// Report `done / total` of the range `[lo, hi]`, e.g. for per-item
    /// loops. Only emits when the integer percentage changes.
    pub fn report_fraction(&self, lo: u8, hi: u8, done: usize, total: usize) {
        if total == 0 {
            self.report(hi);
            return;
        }
        let span = hi.saturating_sub(lo) as usize;
        let pct = lo as usize + span * done.min(total) / total;
        self.report(pct as u8);
    }
}

impl Progress for Milestones<'_> {
    fn report_progress(&self, percent: u8) {
        self.report(percent)
    }
}
