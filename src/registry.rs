use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::resource::{ResourceHandle, ResourceKind, TerminatePolicy, Undo};
use crate::system::SystemOps;

/// What an unwind released and what it could not.
#[derive(Debug, Default)]
pub struct UnwindReport {
    pub released: Vec<String>,
    pub failures: Vec<String>,
}

impl UnwindReport {
    pub fn merge(&mut self, other: UnwindReport) {
        self.released.extend(other.released);
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Stack of everything the session has acquired.
///
/// Handles are pushed only once the resource exists and are released in
/// reverse order. After [`unwind_all`](Self::unwind_all) the registry is
/// drained for good: later unwinds do nothing and a handle registered late
/// (an acquisition that raced a signal-triggered teardown) is released
/// immediately instead of being stored.
pub struct ResourceRegistry {
    handles: Mutex<Vec<ResourceHandle>>,
    drained: AtomicBool,
    ops: Arc<dyn SystemOps>,
    policy: TerminatePolicy,
}

impl ResourceRegistry {
    pub fn new(ops: Arc<dyn SystemOps>, policy: TerminatePolicy) -> Self {
        ResourceRegistry {
            handles: Mutex::new(Vec::new()),
            drained: AtomicBool::new(false),
            ops,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ResourceHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, handle: ResourceHandle) {
        let mut handles = self.lock();
        if self.drained.load(Ordering::SeqCst) {
            drop(handles);
            warn!("{} acquired after teardown, releasing it now", handle);
            let mut report = UnwindReport::default();
            self.release(handle, &mut report);
            return;
        }
        debug!("acquired {}", handle);
        handles.push(handle);
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ResourceHandle> {
        self.lock().clone()
    }

    /// Drops the handle of a child that has already exited and been reaped,
    /// without signalling it: its PID may since belong to another process.
    pub fn forget_process(&self, pid: u32) -> Option<ResourceHandle> {
        let mut handles = self.lock();
        let idx = handles
            .iter()
            .rposition(|h| matches!(h.undo, Undo::Terminate { pid: p, .. } if p == pid))?;
        let handle = handles.remove(idx);
        debug!("forgot exited {}", handle);
        Some(handle)
    }

    /// Releases every handle of `kind`, newest first, leaving the rest in place.
    pub fn unwind_kind(&self, kind: ResourceKind) -> UnwindReport {
        let selected: Vec<ResourceHandle> = {
            let mut handles = self.lock();
            if self.drained.load(Ordering::SeqCst) {
                return UnwindReport::default();
            }
            let (selected, kept) = mem::take(&mut *handles)
                .into_iter()
                .partition(|h| h.kind == kind);
            *handles = kept;
            selected
        };

        let mut report = UnwindReport::default();
        for handle in selected.into_iter().rev() {
            self.release(handle, &mut report);
        }
        report
    }

    /// Releases everything, newest first. Failures are logged and collected;
    /// they never stop the remaining releases. Only the first call does work.
    pub fn unwind_all(&self) -> UnwindReport {
        let handles = {
            let mut handles = self.lock();
            if self.drained.swap(true, Ordering::SeqCst) {
                debug!("registry already drained");
                return UnwindReport::default();
            }
            mem::take(&mut *handles)
        };

        let mut report = UnwindReport::default();
        for handle in handles.into_iter().rev() {
            self.release(handle, &mut report);
        }
        report
    }

    fn release(&self, handle: ResourceHandle, report: &mut UnwindReport) {
        match handle.undo.apply(self.ops.as_ref(), &self.policy) {
            Ok(()) => {
                debug!("released {}", handle);
                report.released.push(handle.to_string());
            }
            Err(e) => {
                warn!("failed to release {}: {}", handle, e);
                report.failures.push(format!("{}: {}", handle, e));
            }
        }
    }
}
