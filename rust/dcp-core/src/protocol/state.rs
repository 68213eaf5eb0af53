// rust/dcp-core/src/protocol/state.rs

//! Call-sequence enforcement shared by storage writers and readers.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CheckpointError, Result};
use crate::identity::CheckpointId;

/// Position of one rank in the fixed protocol call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Uninitialized,
    Identified,
    /// Reader only: committed metadata has been read.
    MetadataRead,
    SetUp,
    LocallyPlanned,
    GloballyPlanned,
    DataInFlight,
    Complete,
    /// Coordinator only: metadata is durable.
    Committed,
    /// I/O or commit failed; only `set_checkpoint_id` leaves this state.
    Aborted,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Uninitialized => "uninitialized",
            ProtocolState::Identified => "identified",
            ProtocolState::MetadataRead => "metadata read",
            ProtocolState::SetUp => "set up",
            ProtocolState::LocallyPlanned => "locally planned",
            ProtocolState::GloballyPlanned => "globally planned",
            ProtocolState::DataInFlight => "data in flight",
            ProtocolState::Complete => "complete",
            ProtocolState::Committed => "committed",
            ProtocolState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Coordinator,
    Follower,
}

impl Role {
    pub fn from_flag(is_coordinator: bool) -> Self {
        if is_coordinator {
            Role::Coordinator
        } else {
            Role::Follower
        }
    }
}

/// Shared view of one attempt's state, handed to spawned I/O tasks.
///
/// A new attempt replaces the tracker's handle, so a late task from an
/// abandoned attempt can only update the state it was started with.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<Mutex<ProtocolState>>);

impl StateHandle {
    fn new(state: ProtocolState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn get(&self) -> ProtocolState {
        *self.0.lock()
    }

    fn set(&self, state: ProtocolState) {
        *self.0.lock() = state;
    }

    /// Records the outcome of the attempt's data phase.
    pub fn settle<T>(&self, outcome: &Result<T>) {
        let mut state = self.0.lock();
        if *state == ProtocolState::DataInFlight {
            *state = if outcome.is_ok() {
                ProtocolState::Complete
            } else {
                ProtocolState::Aborted
            };
        }
    }
}

/// Enforces the step order of one protocol instance.
#[derive(Debug)]
pub struct ProtocolTracker {
    protocol: &'static str,
    checkpoint_id: Option<CheckpointId>,
    role: Option<Role>,
    state: StateHandle,
}

impl ProtocolTracker {
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            checkpoint_id: None,
            role: None,
            state: StateHandle::new(ProtocolState::Uninitialized),
        }
    }

    pub fn with_checkpoint_id(protocol: &'static str, checkpoint_id: CheckpointId) -> Self {
        let mut tracker = Self::new(protocol);
        tracker.reset(checkpoint_id);
        tracker
    }

    pub fn state(&self) -> ProtocolState {
        self.state.get()
    }

    pub fn checkpoint_id(&self) -> Option<&CheckpointId> {
        self.checkpoint_id.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Some(Role::Coordinator)
    }

    /// Starts a new attempt for `checkpoint_id`, discarding all prior state.
    pub fn reset(&mut self, checkpoint_id: CheckpointId) {
        self.checkpoint_id = Some(checkpoint_id);
        self.role = None;
        self.state = StateHandle::new(ProtocolState::Identified);
    }

    /// Returns the checkpoint id, failing if none was ever set.
    pub fn require_checkpoint_id(&self, operation: &str) -> Result<&CheckpointId> {
        self.checkpoint_id.as_ref().ok_or_else(|| {
            CheckpointError::invalid_state(
                self.op(operation),
                self.state(),
                "no checkpoint id has been set",
            )
        })
    }

    pub fn set_up(&mut self, role: Role) -> Result<()> {
        self.enter_set_up(role, ProtocolState::Identified)
    }

    pub fn metadata_read(&self) -> Result<()> {
        self.expect("read metadata", &[ProtocolState::Identified, ProtocolState::MetadataRead])?;
        self.state.set(ProtocolState::MetadataRead);
        Ok(())
    }

    /// Reader set up, which must follow a successful metadata read.
    pub fn set_up_after_metadata(&mut self, role: Role) -> Result<()> {
        self.enter_set_up(role, ProtocolState::MetadataRead)
    }

    fn enter_set_up(&mut self, role: Role, from: ProtocolState) -> Result<()> {
        self.expect("set up", &[from])?;
        self.role = Some(role);
        self.state.set(ProtocolState::SetUp);
        Ok(())
    }

    pub fn local_planned(&self) -> Result<()> {
        self.expect("prepare a local plan", &[ProtocolState::SetUp])?;
        self.state.set(ProtocolState::LocallyPlanned);
        Ok(())
    }

    pub fn global_planned(&self) -> Result<()> {
        self.expect_coordinator("prepare the global plan")?;
        self.expect("prepare the global plan", &[ProtocolState::LocallyPlanned])?;
        self.state.set(ProtocolState::GloballyPlanned);
        Ok(())
    }

    /// Moves into the data phase and returns the handle the I/O task settles.
    ///
    /// The coordinator must have produced the global plan first. A second call
    /// in the same attempt fails.
    pub fn begin_io(&self, operation: &str) -> Result<StateHandle> {
        let required = if self.is_coordinator() {
            ProtocolState::GloballyPlanned
        } else {
            ProtocolState::LocallyPlanned
        };
        self.expect(operation, &[required])?;
        self.state.set(ProtocolState::DataInFlight);
        Ok(self.state.clone())
    }

    /// Checks that the coordinator may commit: every local write completed.
    pub fn check_commit(&self) -> Result<()> {
        self.expect_coordinator("finish")?;
        self.expect("finish", &[ProtocolState::Complete])
    }

    pub fn committed(&self) {
        self.state.set(ProtocolState::Committed);
    }

    pub fn abort(&self) {
        self.state.set(ProtocolState::Aborted);
    }

    pub fn expect_coordinator(&self, operation: &str) -> Result<()> {
        if self.is_coordinator() {
            return Ok(());
        }
        Err(CheckpointError::invalid_state(
            self.op(operation),
            self.state(),
            match self.role {
                Some(Role::Follower) => "only the coordinator may perform this step",
                _ => "role has not been set up",
            },
        ))
    }

    pub fn expect(&self, operation: &str, allowed: &[ProtocolState]) -> Result<()> {
        let current = self.state();
        if allowed.contains(&current) {
            return Ok(());
        }
        let expected: Vec<String> = allowed.iter().map(ToString::to_string).collect();
        Err(CheckpointError::invalid_state(
            self.op(operation),
            current,
            format!("expected {}", expected.join(" or ")),
        ))
    }

    fn op(&self, operation: &str) -> String {
        format!("{} {operation}", self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn tracker() -> ProtocolTracker {
        ProtocolTracker::with_checkpoint_id("storage writer", CheckpointId::from("ckpt"))
    }

    #[test]
    fn test_coordinator_sequence() {
        let mut t = tracker();
        t.set_up(Role::Coordinator).unwrap();
        t.local_planned().unwrap();
        t.global_planned().unwrap();
        let handle = t.begin_io("write data").unwrap();
        assert_eq!(t.state(), ProtocolState::DataInFlight);

        handle.settle(&Ok::<(), CheckpointError>(()));
        assert_eq!(t.state(), ProtocolState::Complete);
        t.check_commit().unwrap();
        t.committed();
        assert_eq!(t.state(), ProtocolState::Committed);
    }

    #[test]
    fn test_follower_skips_global_plan() {
        let mut t = tracker();
        t.set_up(Role::Follower).unwrap();
        t.local_planned().unwrap();

        let err = t.global_planned().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.to_string().contains("only the coordinator"));

        t.begin_io("write data").unwrap();
        assert!(t.check_commit().is_err());
    }

    #[test]
    fn test_coordinator_cannot_write_before_global_plan() {
        let mut t = tracker();
        t.set_up(Role::Coordinator).unwrap();
        t.local_planned().unwrap();
        let err = t.begin_io("write data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_second_io_call_rejected() {
        let mut t = tracker();
        t.set_up(Role::Follower).unwrap();
        t.local_planned().unwrap();
        t.begin_io("read data").unwrap();
        assert!(t.begin_io("read data").is_err());
    }

    #[test]
    fn test_failed_io_aborts() {
        let mut t = tracker();
        t.set_up(Role::Coordinator).unwrap();
        t.local_planned().unwrap();
        t.global_planned().unwrap();
        let handle = t.begin_io("write data").unwrap();
        handle.settle(&Err::<(), _>(CheckpointError::checkpoint("disk gone")));
        assert_eq!(t.state(), ProtocolState::Aborted);
        assert!(t.check_commit().is_err());
    }

    #[test]
    fn test_reset_detaches_stale_handle() {
        let mut t = tracker();
        t.set_up(Role::Follower).unwrap();
        t.local_planned().unwrap();
        let stale = t.begin_io("write data").unwrap();

        t.reset(CheckpointId::from("ckpt"));
        stale.settle(&Ok::<(), CheckpointError>(()));
        assert_eq!(t.state(), ProtocolState::Identified);
        assert_eq!(t.role(), None);
    }

    #[test]
    fn test_set_up_requires_identifier() {
        let mut t = ProtocolTracker::new("storage reader");
        let err = t.set_up(Role::Follower).unwrap_err();
        assert!(err.to_string().contains("uninitialized"));
        assert!(t.require_checkpoint_id("read metadata").is_err());
    }

    #[test]
    fn test_reader_set_up_needs_metadata() {
        let mut t = ProtocolTracker::with_checkpoint_id("storage reader", CheckpointId::from("ckpt"));
        let err = t.set_up_after_metadata(Role::Coordinator).unwrap_err();
        assert!(err.to_string().contains("expected metadata read"));

        t.metadata_read().unwrap();
        t.metadata_read().unwrap();
        t.set_up_after_metadata(Role::Coordinator).unwrap();
        assert_eq!(t.state(), ProtocolState::SetUp);
        assert!(t.metadata_read().is_err());
    }

    #[test]
    fn test_out_of_order_local_plan() {
        let t = tracker();
        let err = t.local_planned().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.to_string().contains("expected set up"));
    }
}
