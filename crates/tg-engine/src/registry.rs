//! Position-link registry.
//!
//! Owns every trade group, its ordered membership and the reverse index
//! from position to owning group. All mutations are versioned through the
//! group's [`ConcurrencyGuard`]; events are published after the group's
//! lock is released.
//!
//! Lock order is group mutex, then reverse-index shard. The reverse index is
//! never held while a group mutex is acquired.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use tg_cache::coherence::GroupDirectory;
use tg_types::errors::RegistryError;
use tg_types::events::{ChangeKind, InvalidationEvent};
use tg_types::group::{GroupStatus, RiskLimits, StrategyType, TradeGroup, TradeGroupId};
use tg_types::position::{PositionId, PositionRef};

use crate::bus::InvalidationBus;
use crate::guard::ConcurrencyGuard;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug)]
struct GroupState {
    group: TradeGroup,
    members: Vec<PositionRef>,
}

#[derive(Debug)]
struct GroupCell {
    guard: ConcurrencyGuard,
    status: AtomicU8,
    state: Mutex<GroupState>,
}

impl GroupCell {
    fn status(&self) -> GroupStatus {
        GroupStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, state: &mut GroupState, status: GroupStatus) {
        state.group.status = status;
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Checks shared by every mutation, in order.
    fn ensure_mutable(&self, state: &GroupState, expected: u64) -> RegistryResult<()> {
        if state.group.status.is_closed() {
            return Err(RegistryError::InvalidState {
                group_id: state.group.id,
                status: state.group.status,
            });
        }
        self.guard.check(expected).map(|_| ())
    }

    /// Bump the version; only ever called with the group mutex held.
    fn commit(&self, state: &mut GroupState, expected: u64) -> RegistryResult<u64> {
        let version = self.guard.advance(expected)?;
        state.group.version = version;
        Ok(version)
    }
}

/// Consistent view of a group and its members at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupView {
    pub group: TradeGroup,
    pub positions: Vec<PositionRef>,
}

pub struct PositionLinkRegistry {
    groups: DashMap<TradeGroupId, Arc<GroupCell>>,
    owners: DashMap<PositionId, TradeGroupId>,
    bus: Arc<InvalidationBus>,
}

impl PositionLinkRegistry {
    pub fn new(bus: Arc<InvalidationBus>) -> Self {
        Self {
            groups: DashMap::new(),
            owners: DashMap::new(),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    pub fn create_group(
        &self,
        name: &str,
        strategy_type: StrategyType,
        risk_limits: RiskLimits,
    ) -> TradeGroup {
        let group = TradeGroup::new(name.to_string(), strategy_type, risk_limits);
        let cell = GroupCell {
            guard: ConcurrencyGuard::new(group.id, group.version),
            status: AtomicU8::new(group.status.as_u8()),
            state: Mutex::new(GroupState {
                group: group.clone(),
                members: Vec::new(),
            }),
        };
        self.groups.insert(group.id, Arc::new(cell));
        info!(group_id = %group.id, name = %group.name, strategy = ?group.strategy_type, "trade group created");
        group
    }

    /// Link `position` to the group, or refresh its attributes if already linked.
    ///
    /// Re-assigning an identical position is a no-op that returns the
    /// current version without publishing.
    pub fn assign_position(
        &self,
        group_id: TradeGroupId,
        position: PositionRef,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        let cell = self.cell(group_id)?;
        let position_id = position.position_id;

        let (version, kind) = {
            let mut state = cell.state.lock();
            cell.ensure_mutable(&state, expected_version)?;

            // closed groups drop their claims, so any other holder is live
            let claim = self.owners.entry(position_id);
            if let Entry::Occupied(held) = &claim {
                let owner = *held.get();
                if owner != group_id {
                    return Err(RegistryError::PositionAlreadyAssigned { position_id, owner });
                }
            }

            let existing = state
                .members
                .iter()
                .position(|p| p.position_id == position_id);
            let kind = match existing {
                Some(idx) if state.members[idx] == position => {
                    debug!(group_id = %group_id, position_id = %position_id, "identical assignment ignored");
                    return Ok(cell.guard.current());
                }
                Some(idx) if state.members[idx].differs_only_in_mark(&position) => ChangeKind::Repriced,
                Some(_) => ChangeKind::Amended,
                None => ChangeKind::Assigned,
            };

            let version = cell.commit(&mut state, expected_version)?;
            match existing {
                Some(idx) => state.members[idx] = position,
                None => state.members.push(position),
            }
            claim.insert(group_id);
            if state.group.status == GroupStatus::Draft {
                cell.set_status(&mut state, GroupStatus::Active);
                info!(group_id = %group_id, "trade group activated");
            }
            (version, kind)
        };

        debug!(group_id = %group_id, position_id = %position_id, change = %kind, version, "position linked");
        self.publish(position_id, group_id, kind, version);
        Ok(version)
    }

    pub fn unassign_position(
        &self,
        group_id: TradeGroupId,
        position_id: PositionId,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        let cell = self.cell(group_id)?;

        let version = {
            let mut state = cell.state.lock();
            cell.ensure_mutable(&state, expected_version)?;
            let idx = Self::member_index(&state, group_id, position_id)?;

            let version = cell.commit(&mut state, expected_version)?;
            state.members.remove(idx);
            self.owners.remove_if(&position_id, |_, owner| *owner == group_id);
            version
        };

        debug!(group_id = %group_id, position_id = %position_id, version, "position unlinked");
        self.publish(position_id, group_id, ChangeKind::Unassigned, version);
        Ok(version)
    }

    /// Update a member's mark. Same mark is a no-op.
    pub fn reprice_position(
        &self,
        group_id: TradeGroupId,
        position_id: PositionId,
        mark_price: Decimal,
        expected_version: u64,
    ) -> RegistryResult<u64> {
        let cell = self.cell(group_id)?;

        let version = {
            let mut state = cell.state.lock();
            cell.ensure_mutable(&state, expected_version)?;
            let idx = Self::member_index(&state, group_id, position_id)?;
            if state.members[idx].mark_price == mark_price {
                return Ok(cell.guard.current());
            }

            let version = cell.commit(&mut state, expected_version)?;
            state.members[idx].mark_price = mark_price;
            version
        };

        self.publish(position_id, group_id, ChangeKind::Repriced, version);
        Ok(version)
    }

    /// Close the group for good and release its positions.
    pub fn close_group(&self, group_id: TradeGroupId, expected_version: u64) -> RegistryResult<u64> {
        let cell = self.cell(group_id)?;

        let mut state = cell.state.lock();
        cell.ensure_mutable(&state, expected_version)?;
        let version = cell.commit(&mut state, expected_version)?;
        cell.set_status(&mut state, GroupStatus::Closed);
        for position in &state.members {
            self.owners
                .remove_if(&position.position_id, |_, owner| *owner == group_id);
        }

        info!(group_id = %group_id, version, members = state.members.len(), "trade group closed");
        Ok(version)
    }

    /// Members in insertion order.
    pub fn list_positions(&self, group_id: TradeGroupId) -> RegistryResult<Vec<PositionRef>> {
        let cell = self.cell(group_id)?;
        let state = cell.state.lock();
        Ok(state.members.clone())
    }

    pub fn group(&self, group_id: TradeGroupId) -> RegistryResult<TradeGroup> {
        let cell = self.cell(group_id)?;
        let state = cell.state.lock();
        Ok(state.group.clone())
    }

    /// Group metadata and members read under one lock.
    pub fn view(&self, group_id: TradeGroupId) -> RegistryResult<GroupView> {
        let cell = self.cell(group_id)?;
        let state = cell.state.lock();
        Ok(GroupView {
            group: state.group.clone(),
            positions: state.members.clone(),
        })
    }

    pub fn group_ids(&self) -> Vec<TradeGroupId> {
        self.groups.iter().map(|g| *g.key()).collect()
    }

    pub fn status(&self, group_id: TradeGroupId) -> Option<GroupStatus> {
        self.groups.get(&group_id).map(|cell| cell.status())
    }

    fn cell(&self, group_id: TradeGroupId) -> RegistryResult<Arc<GroupCell>> {
        self.groups
            .get(&group_id)
            .map(|cell| cell.value().clone())
            .ok_or(RegistryError::GroupNotFound { group_id })
    }

    fn member_index(
        state: &GroupState,
        group_id: TradeGroupId,
        position_id: PositionId,
    ) -> RegistryResult<usize> {
        state
            .members
            .iter()
            .position(|p| p.position_id == position_id)
            .ok_or(RegistryError::PositionNotFound {
                group_id,
                position_id,
            })
    }

    fn publish(&self, position_id: PositionId, group_id: TradeGroupId, kind: ChangeKind, version: u64) {
        let event = InvalidationEvent::new(position_id, group_id, kind, version);
        self.bus.publish(&event);
    }
}

impl GroupDirectory for PositionLinkRegistry {
    fn current_version(&self, group_id: TradeGroupId) -> Option<u64> {
        self.groups.get(&group_id).map(|cell| cell.guard.current())
    }

    fn owner_of(&self, position_id: PositionId) -> Option<TradeGroupId> {
        self.owners.get(&position_id).map(|owner| *owner.value())
    }
}
