/*!
# FleetLink DevKit - test doubles for the agent core

Helpers for testing the agent without a broker or a real device:
- Mock dispatcher channel with scripted replies
- Recording collaborators sharing an ordered call log
- Static hardware probe with a settable hostname
- Test harness wiring all of the above
*/

pub mod collaborators;
pub mod dispatcher_stub;
pub mod test_utils;

pub use collaborators::{CallLog, RecordingDrain, StaticHardwareProbe};
pub use dispatcher_stub::{MockDispatcher, MockRegistration, ScriptedReply};
pub use test_utils::TestHarness;
