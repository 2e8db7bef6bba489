/// Receives the completion percentage of an upload.
pub type ProgressFn = Box<dyn FnMut(u8) + Send>;

/// Turns written blocks into a 0-100 percentage of the size the client
/// declared through `tsize`.
pub struct ProgressTracker {
    declared_size: u64,
    block_size: u64,
    last_percent: Option<u8>,
    callback: Option<ProgressFn>,
}

impl ProgressTracker {
    pub fn new(declared_size: u64, block_size: usize, callback: Option<ProgressFn>) -> Self {
        Self {
            declared_size,
            block_size: block_size as u64,
            last_percent: None,
            callback,
        }
    }

    /// Percentage after `blocks_written` full-size blocks, capped at 100.
    /// `None` when the client declared no size.
    pub fn percent(&self, blocks_written: u64) -> Option<u8> {
        if self.declared_size == 0 {
            return None;
        }
        let done = u128::from(blocks_written) * u128::from(self.block_size) * 100;
        let percent = (done / u128::from(self.declared_size)).min(100);
        Some(percent as u8)
    }

    /// Report progress; the callback only fires when the value changed.
    pub fn update(&mut self, blocks_written: u64) {
        let Some(percent) = self.percent(blocks_written) else {
            return;
        };
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        if let Some(callback) = self.callback.as_mut() {
            callback(percent);
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("declared_size", &self.declared_size)
            .field("block_size", &self.block_size)
            .field("last_percent", &self.last_percent)
            .finish_non_exhaustive()
    }
}
