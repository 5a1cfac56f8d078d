//! Upload progress reporting at 10% granularity.

use tracing::info;

/// Logs transfer progress once per new decile.
#[derive(Debug, Clone)]
pub struct DecileReporter {
    label: String,
    total: u64,
    sent: u64,
    last_decile: Option<u8>,
}

impl DecileReporter {
    pub fn new(label: impl Into<String>, total: u64) -> Self {
        Self {
            label: label.into(),
            total,
            sent: 0,
            last_decile: None,
        }
    }

    /// Bytes reported so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Account for `bytes` more bytes sent. Returns the percentage when a
    /// new decile was reached (and logged).
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.observe(self.sent.saturating_add(bytes))
    }

    /// Record the cumulative byte count.
    pub fn observe(&mut self, sent: u64) -> Option<u8> {
        self.sent = sent;
        let decile = self.decile(sent);
        if self.last_decile.is_some_and(|last| decile <= last) {
            return None;
        }
        self.last_decile = Some(decile);

        let percent = decile * 10;
        info!(
            file = %self.label,
            percent,
            sent_bytes = sent,
            total_bytes = self.total,
            "Upload progress: {}%",
            percent
        );
        Some(percent)
    }

    fn decile(&self, sent: u64) -> u8 {
        if self.total == 0 {
            return 10;
        }
        (u128::from(sent.min(self.total)) * 10 / u128::from(self.total)) as u8
    }
}
