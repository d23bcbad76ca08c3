
pub mod checksum;

use parking_lot::Mutex;

use std::sync::Arc;

type OnDrop = Box<dyn FnOnce() + Send>;

struct DropGuard {
    on_drop: Mutex<Option<OnDrop>>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.get_mut().take() {
            on_drop();
        }
    }
}

/// Runs a closure when the last clone is dropped. Used to abort background
/// tasks owned by a cloneable handle.
#[derive(Clone)]
pub struct DropDetector {
    inner: Arc<DropGuard>,
}

impl DropDetector {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(DropGuard { on_drop: Mutex::new(Some(Box::new(on_drop))) }),
        }
    }

    pub fn clones(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for DropDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DropDetector({} clones)", self.clones())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_drop_detector_fires_once_after_last_clone() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let detector = DropDetector::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = detector.clone();
        assert_eq!(detector.clones(), 2);

        drop(detector);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
