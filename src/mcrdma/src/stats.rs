//! Process-wide connection counters.

/// Counters shared by the dispatcher and every worker. Updated under one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub curr_conns: u64,
    pub total_conns: u64,
    pub conn_structs: u64,
    pub malloc_fails: u64,
    pub rejected_conns: u64,
    pub accept_failures: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    inner: spin::Mutex<ConnStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn snapshot(&self) -> ConnStats {
        *self.inner.lock()
    }

    pub(crate) fn conn_opened(&self) {
        let mut stats = self.inner.lock();
        stats.conn_structs += 1;
        stats.curr_conns += 1;
        stats.total_conns += 1;
    }

    pub(crate) fn conn_closed(&self) {
        let mut stats = self.inner.lock();
        stats.curr_conns = stats.curr_conns.saturating_sub(1);
        stats.conn_structs = stats.conn_structs.saturating_sub(1);
    }

    pub(crate) fn malloc_failed(&self) {
        self.inner.lock().malloc_fails += 1;
    }

    pub(crate) fn conn_rejected(&self) {
        self.inner.lock().rejected_conns += 1;
    }

    pub(crate) fn accept_failed(&self) {
        self.inner.lock().accept_failures += 1;
    }
}
