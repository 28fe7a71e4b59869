//! Post-simulation callbacks.
//!
//! A callback receives a [`CompletionEvent`] (the run's results and log
//! files plus the arguments bound at registration) and returns a text
//! result or an error message. Inline callbacks run on the task's
//! supervisor thread; isolated callbacks run on a dedicated thread that
//! receives the event over a channel and answers over another. Both
//! report panics as errors, so callers see the same behavior either way.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use crate::error::{Result, SpiceBatchError};

/// What a callback returns: its result text, or an error message.
pub type CallbackOutcome = std::result::Result<String, String>;

type CallbackFn = dyn Fn(&CompletionEvent) -> CallbackOutcome + Send + Sync;

/// Handed to a callback when its simulation finishes successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub seq: u64,
    pub raw_file: PathBuf,
    pub log_file: PathBuf,
    /// Extra arguments, keyed by declared parameter name.
    pub args: BTreeMap<String, String>,
}

impl CompletionEvent {
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackMode {
    #[default]
    Inline,
    Isolated,
}

/// Extra arguments supplied when a run is launched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CallbackArgs {
    #[default]
    None,
    Positional(Vec<String>),
    Named(BTreeMap<String, String>),
}

#[derive(Clone)]
pub struct Callback {
    name: String,
    params: Vec<String>,
    mode: CallbackMode,
    func: Arc<CallbackFn>,
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Callback {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&CompletionEvent) -> CallbackOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            mode: CallbackMode::Inline,
            func: Arc::new(func),
        }
    }

    /// Declare the extra parameters the callback expects, in order.
    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Run the callback on its own thread instead of the supervisor's.
    pub fn isolated(mut self) -> Self {
        self.mode = CallbackMode::Isolated;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> CallbackMode {
        self.mode
    }

    /// Check `args` against the declared parameters.
    ///
    /// Positional arguments are matched to parameters by order; named
    /// arguments must cover every parameter. Any count or name mismatch
    /// fails with [`SpiceBatchError::InvalidCallback`].
    pub fn bind(self, args: CallbackArgs) -> Result<BoundCallback> {
        let args = match args {
            CallbackArgs::None if self.params.is_empty() => BTreeMap::new(),
            CallbackArgs::None => {
                return Err(SpiceBatchError::InvalidCallback(format!(
                    "{} expects {} extra argument(s) but none were given",
                    self.name,
                    self.params.len()
                )))
            }
            CallbackArgs::Positional(values) => {
                if values.len() != self.params.len() {
                    return Err(SpiceBatchError::InvalidCallback(format!(
                        "{} expects {} extra argument(s), {} given",
                        self.name,
                        self.params.len(),
                        values.len()
                    )));
                }
                self.params.iter().cloned().zip(values).collect()
            }
            CallbackArgs::Named(map) => {
                if let Some(missing) = self.params.iter().find(|p| !map.contains_key(*p)) {
                    return Err(SpiceBatchError::InvalidCallback(format!(
                        "{} argument '{}' not given",
                        self.name, missing
                    )));
                }
                if map.len() != self.params.len() {
                    return Err(SpiceBatchError::InvalidCallback(format!(
                        "{} expects {} extra argument(s), {} given",
                        self.name,
                        self.params.len(),
                        map.len()
                    )));
                }
                map
            }
        };
        Ok(BoundCallback { callback: self, args })
    }
}

/// A callback with validated arguments, ready to run.
#[derive(Debug, Clone)]
pub struct BoundCallback {
    callback: Callback,
    args: BTreeMap<String, String>,
}

fn run_guarded(func: &CallbackFn, event: &CompletionEvent) -> CallbackOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| func(event))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("callback panicked: {}", message))
        }
    }
}

impl BoundCallback {
    pub fn name(&self) -> &str {
        self.callback.name()
    }

    /// Deliver a completion event and wait for the callback's answer.
    pub(crate) fn dispatch(&self, seq: u64, raw_file: PathBuf, log_file: PathBuf) -> CallbackOutcome {
        let event = CompletionEvent {
            seq,
            raw_file,
            log_file,
            args: self.args.clone(),
        };
        match self.callback.mode {
            CallbackMode::Inline => run_guarded(self.callback.func.as_ref(), &event),
            CallbackMode::Isolated => self.dispatch_isolated(event),
        }
    }

    fn dispatch_isolated(&self, event: CompletionEvent) -> CallbackOutcome {
        let (event_tx, event_rx) = mpsc::channel::<CompletionEvent>();
        let (reply_tx, reply_rx) = mpsc::channel::<CallbackOutcome>();
        let func = Arc::clone(&self.callback.func);
        let spawned = thread::Builder::new()
            .name(format!("callback-{}-{}", self.callback.name, event.seq))
            .spawn(move || {
                for event in event_rx {
                    let outcome = run_guarded(func.as_ref(), &event);
                    if reply_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => return Err(format!("cannot start callback thread: {}", e)),
        };
        let outcome = match event_tx.send(event) {
            Ok(()) => reply_rx
                .recv()
                .unwrap_or_else(|_| Err("callback thread exited without a reply".to_string())),
            Err(_) => Err("callback thread is not accepting events".to_string()),
        };
        drop(event_tx);
        let _ = worker.join();
        outcome
    }
}
