//! Legal phase transitions

use crate::types::Phase;

/// Whether a match may move directly from `from` to `to`.
///
/// The happy path runs PREGAME through ACTIVE in order. ACTIVE ends in
/// COMPLETED, CANCELLED or DISPUTED; ROOM_CODE may also be cancelled; any
/// non-terminal phase may fail. Terminal phases have no outgoing edges.
pub fn is_legal(from: Phase, to: Phase) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == Phase::Failed {
        return true;
    }
    if from.successor() == Some(to) {
        return true;
    }
    matches!(
        (from, to),
        (Phase::RoomCode, Phase::Cancelled)
            | (Phase::Active, Phase::Cancelled)
            | (Phase::Active, Phase::Disputed)
    )
}

/// All phases reachable in one step from `from`
pub fn next_phases(from: Phase) -> Vec<Phase> {
    ALL_PHASES
        .iter()
        .copied()
        .filter(|to| is_legal(from, *to))
        .collect()
}

pub const ALL_PHASES: [Phase; 10] = [
    Phase::Pregame,
    Phase::StageSelect,
    Phase::CaptainSelect,
    Phase::HostSelect,
    Phase::RoomCode,
    Phase::Active,
    Phase::Completed,
    Phase::Cancelled,
    Phase::Disputed,
    Phase::Failed,
];
