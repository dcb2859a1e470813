//! Session Coordinator (spec §4.1): session lifecycle state machine,
//! approval workflow, and admission-controlled placement against the fleet.

pub mod approval;
pub mod coordinator;
pub mod error;
pub mod state_machine;

pub use coordinator::SessionCoordinator;
pub use error::{Result, SessionError};
pub use state_machine::{SessionEvent, SessionStateMachine, StateMachineError};
