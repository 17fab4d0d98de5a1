mod product;
mod state;

#[cfg(test)]
pub use product::Phase;
pub use product::{AbortReason, Decision, Disposition, LedgerEntry, ProductInstance};
pub use state::{DispositionState, StateMachine, StepOutcome, Transition};
