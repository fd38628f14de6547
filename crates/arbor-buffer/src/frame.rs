//! Page frames and their exclusive latches.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_common::page::{PageId, PAGE_SIZE};

use crate::page::RecordPage;

/// Owned exclusive latch on a frame's state.
pub type FrameGuard = ArcMutexGuard<RawMutex, FrameState>;

/// Mutable state of a frame, protected by the frame latch.
pub struct FrameState {
    /// Page image.
    pub(crate) data: Box<[u8; PAGE_SIZE]>,
    /// Cached per-page object owned by the access method. Dropped whenever
    /// the page is changed by undo.
    pub(crate) aux: Option<Box<dyn Any + Send>>,
    /// Set on every change, cleared by checkpoint.
    pub(crate) dirty: bool,
}

impl FrameState {
    /// Returns the page image.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Returns true if the page was removed from its container.
    #[inline]
    pub fn is_freed(&self) -> bool {
        RecordPage::page_header(&self.data[..]).flags.is_freed()
    }
}

/// A container page held in memory.
///
/// The frame latch is an exclusive mutex. Holders take it as an owned
/// `Arc` guard so a latch can be carried around independently of the
/// container map that handed it out.
pub struct PageFrame {
    page_id: PageId,
    state: Arc<Mutex<FrameState>>,
    /// Number of latch requests.
    latch_requests: AtomicU64,
    /// Number of latch requests that had to wait.
    latch_waits: AtomicU64,
}

impl PageFrame {
    /// Creates a frame holding a freshly formatted record page.
    pub fn new(page_id: PageId, page_size: usize) -> Self {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        RecordPage::init(&mut data[..], page_id, page_size);
        Self::from_image(page_id, data, true)
    }

    /// Creates a frame from an existing page image.
    pub fn from_image(page_id: PageId, data: Box<[u8; PAGE_SIZE]>, dirty: bool) -> Self {
        Self {
            page_id,
            state: Arc::new(Mutex::new(FrameState {
                data,
                aux: None,
                dirty,
            })),
            latch_requests: AtomicU64::new(0),
            latch_waits: AtomicU64::new(0),
        }
    }

    /// Returns the page id.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latches the frame, blocking until the latch is available.
    pub fn latch(&self) -> FrameGuard {
        self.latch_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(guard) = self.state.try_lock_arc() {
            return guard;
        }
        self.latch_waits.fetch_add(1, Ordering::Relaxed);
        self.state.lock_arc()
    }

    /// Latches the frame only if no one else holds it.
    pub fn try_latch(&self) -> Option<FrameGuard> {
        self.latch_requests.fetch_add(1, Ordering::Relaxed);
        self.state.try_lock_arc()
    }

    /// Returns true if some holder currently has the latch.
    #[inline]
    pub fn is_latched(&self) -> bool {
        self.state.is_locked()
    }

    /// Returns (latch requests, latch requests that waited).
    pub fn latch_stats(&self) -> (u64, u64) {
        (
            self.latch_requests.load(Ordering::Relaxed),
            self.latch_waits.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("page_id", &self.page_id)
            .field("latched", &self.is_latched())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_frame_is_formatted() {
        let frame = PageFrame::new(PageId::new(3, 7), 4096);
        let guard = frame.latch();
        assert_eq!(RecordPage::slot_count(guard.data()), 0);
        assert_eq!(
            RecordPage::page_header(guard.data()).page_id,
            PageId::new(3, 7)
        );
        assert!(guard.dirty);
        assert!(!guard.is_freed());
    }

    #[test]
    fn test_try_latch_fails_while_held() {
        let frame = PageFrame::new(PageId::new(1, 1), 4096);
        let guard = frame.latch();
        assert!(frame.is_latched());
        assert!(frame.try_latch().is_none());
        drop(guard);
        assert!(!frame.is_latched());
        assert!(frame.try_latch().is_some());
    }

    #[test]
    fn test_latch_is_exclusive_across_threads() {
        let frame = Arc::new(PageFrame::new(PageId::new(1, 1), 4096));
        let guard = frame.latch();

        let f = Arc::clone(&frame);
        let handle = std::thread::spawn(move || {
            let mut guard = f.latch();
            guard.dirty = false;
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();

        assert!(!frame.latch().dirty);
        let (requests, waits) = frame.latch_stats();
        assert_eq!(requests, 3);
        assert!(waits <= 1);
    }

    #[test]
    fn test_aux_slot() {
        let frame = PageFrame::new(PageId::new(1, 1), 4096);
        let mut guard = frame.latch();
        guard.aux = Some(Box::new(42u32));
        assert_eq!(
            guard.aux.as_ref().and_then(|a| a.downcast_ref::<u32>()),
            Some(&42)
        );
    }
}
