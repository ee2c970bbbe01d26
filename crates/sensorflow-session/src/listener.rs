/*!
 * Change listeners.
 *
 * A listener is invoked once per change event, in arrival order, on the
 * controller task. A listener that returns an error or panics is logged and
 * the session carries on.
 */
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, info, warn};

use sensorflow_devices::ChangeEvent;

/// Receives change events from a session
pub trait ChangeListener: Send {
    /// Handle one event
    fn on_change(&mut self, event: &ChangeEvent) -> anyhow::Result<()>;
}

impl<F> ChangeListener for F
where
    F: FnMut(&ChangeEvent) -> anyhow::Result<()> + Send,
{
    fn on_change(&mut self, event: &ChangeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Logs every reading as `{label}: {value}`
#[derive(Debug, Clone)]
pub struct LoggingListener {
    label: String,
}

impl LoggingListener {
    /// Create a listener that prefixes readings with `label`
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
        }
    }

    /// The label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Render one reading
    pub fn format(&self, event: &ChangeEvent) -> String {
        format!("{}: {}", self.label, event.value)
    }
}

impl ChangeListener for LoggingListener {
    fn on_change(&mut self, event: &ChangeEvent) -> anyhow::Result<()> {
        info!(channel = %event.channel, "{}", self.format(event));
        Ok(())
    }
}

/// Outcome of handing one event to a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The listener returned `Ok`
    Delivered,
    /// The listener returned an error
    Failed,
    /// The listener panicked
    Panicked,
}

/// Invoke `listener` with `event`, containing errors and panics
pub fn deliver(listener: &mut dyn ChangeListener, event: &ChangeEvent) -> Delivery {
    match catch_unwind(AssertUnwindSafe(|| listener.on_change(event))) {
        Ok(Ok(())) => Delivery::Delivered,
        Ok(Err(e)) => {
            warn!("Change listener failed on {}: {:#}", event.value, e);
            Delivery::Failed
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Change listener panicked on {}: {}", event.value, message);
            Delivery::Panicked
        }
    }
}
