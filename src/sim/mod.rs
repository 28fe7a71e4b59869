//! Running batches of simulations through an external engine.

pub mod callback;
pub mod scheduler;
pub mod simulator;
pub mod stepper;
pub mod task;

pub use callback::{Callback, CallbackArgs, CallbackMode, CallbackOutcome, CompletionEvent};
pub use scheduler::{LaunchOutcome, RunInput, RunOptions, SchedulerConfig, TaskScheduler};
pub use simulator::{CommandSimulator, Ngspice, Simulator, Xyce};
pub use stepper::{SimStepper, StepTarget};
pub use task::{TaskReport, TaskStatus};
