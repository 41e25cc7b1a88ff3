use boreal_primitives::ViewId;

/// How the node currently participates in consensus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Full participant in the happy path.
    Normal,
    /// A view change is in flight; PREPARE and COMMIT are dropped, but
    /// ANNOUNCE/PREPARED/COMMITTED are still logged for silent catch-up.
    ViewChanging,
    /// Observing only: the node's key is not in the current committee.
    Listening,
}

/// The FBFT step within the current block number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FbftPhase {
    /// Waiting for (or about to send) the leader's ANNOUNCE.
    Announce,
    /// Announce handled; prepare ballots in flight.
    Prepare,
    /// Prepare quorum reached; commit ballots in flight.
    Commit,
}

/// Leader term tracking. The view id only moves forward: it bumps on every
/// committed block and on every accepted NEWVIEW.
#[derive(Clone, Debug)]
pub struct View {
    view_id: ViewId,
    mode: Mode,
}

impl View {
    pub fn new(mode: Mode) -> Self {
        Self { view_id: 0, mode }
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Adopts a higher view id. Lower or equal ids are ignored so stale
    /// view-change traffic cannot rewind the term.
    pub fn advance_to(&mut self, view_id: ViewId) {
        if view_id > self.view_id {
            self.view_id = view_id;
        }
    }

    pub fn set_view_id(&mut self, view_id: ViewId) {
        self.view_id = view_id;
    }
}

/// Deterministic leader rotation: the leader for a view is the roster
/// entry at `view_id mod committee size`. Every honest node computes the
/// same answer with no communication.
pub fn leader_index_for_view(view_id: ViewId, committee_size: usize) -> usize {
    if committee_size == 0 {
        return 0;
    }
    (view_id % committee_size as u64) as usize
}
