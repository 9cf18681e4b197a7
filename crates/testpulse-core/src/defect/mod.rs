//! Defect lifecycle: the automaton driven by test results, flaky detection,
//! fingerprint locking and reopen history.

mod automaton;
mod flaky;
mod history;
mod locks;

pub use automaton::{DefectAutomaton, DefectOutcome, Transition};
pub use flaky::mixes_pass_and_failure;
pub use history::DefectHistory;
pub use locks::FingerprintLocks;
