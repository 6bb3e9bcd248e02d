#![forbid(unsafe_code)]

//! Session configuration.

/// What `dispose` does with items that are still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DisposeMode {
    /// Cancel the session token immediately. The item in flight observes
    /// cancellation and every queued item completes as cancelled without
    /// running.
    #[default]
    CancelPending,
    /// Stop accepting items, run everything already queued, then stop.
    ///
    /// An asynchronous item that never completes keeps `dispose` blocked.
    Drain,
}

/// Configuration for a [`Session`](crate::Session).
///
/// With the `serde` feature, missing fields take their default values:
///
/// ```json
/// { "thread_name": "ui-tests", "dispose_mode": "drain" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Name of the worker thread.
    pub thread_name: String,
    /// Worker thread stack size in bytes (`None` = platform default).
    pub stack_size: Option<usize>,
    /// Behavior of `dispose` for queued items.
    pub dispose_mode: DisposeMode,
    /// Let an active nested pump take items from the session queue.
    ///
    /// Off by default: a re-entrant dispatch then runs strictly after the
    /// item that issued it. When on, a pump that has nothing else to do
    /// runs the next queued item inline (still in queue order), so an
    /// asynchronous action can await a dispatch it issued itself.
    pub inline_queue_servicing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thread_name: "ftui-headless".into(),
            stack_size: None,
            dispose_mode: DisposeMode::CancelPending,
            inline_queue_servicing: false,
        }
    }
}

impl SessionConfig {
    /// Set the worker thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Set the dispose behavior.
    #[must_use]
    pub fn with_dispose_mode(mut self, mode: DisposeMode) -> Self {
        self.dispose_mode = mode;
        self
    }

    /// Enable or disable inline queue servicing from nested pumps.
    #[must_use]
    pub fn with_inline_queue_servicing(mut self, enabled: bool) -> Self {
        self.inline_queue_servicing = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.thread_name, "ftui-headless");
        assert_eq!(config.stack_size, None);
        assert_eq!(config.dispose_mode, DisposeMode::CancelPending);
        assert!(!config.inline_queue_servicing);
    }

    #[test]
    fn builder_chain() {
        let config = SessionConfig::default()
            .with_thread_name("ui-tests")
            .with_stack_size(4 << 20)
            .with_dispose_mode(DisposeMode::Drain)
            .with_inline_queue_servicing(true);
        assert_eq!(config.thread_name, "ui-tests");
        assert_eq!(config.stack_size, Some(4 << 20));
        assert_eq!(config.dispose_mode, DisposeMode::Drain);
        assert!(config.inline_queue_servicing);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_json_fills_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "thread_name": "ui-tests", "dispose_mode": "drain" }"#)
                .unwrap();
        assert_eq!(config.thread_name, "ui-tests");
        assert_eq!(config.dispose_mode, DisposeMode::Drain);
        assert_eq!(config.stack_size, None);
        assert!(!config.inline_queue_servicing);
    }
}
