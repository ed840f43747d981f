use dashmap::DashSet;

/// Remembers processed button-press ids so redelivered or double-dispatched
/// presses run their effect once.
///
/// `check_and_mark` must run before the handler's first await point.
#[derive(Default)]
pub struct CallbackDeduplicator {
    seen: DashSet<String>,
}

impl CallbackDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `id` is seen, false on every later call.
    pub fn check_and_mark(&self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    /// Allow `id` to be processed again, e.g. after an export failed and the
    /// user should be able to retry from the same button.
    pub fn forget(&self, id: &str) {
        self.seen.remove(id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.seen.clear();
    }
}
