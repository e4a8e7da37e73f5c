use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::InstrumentKey;

/// Unique position identifier
pub type PositionId = Uuid;

/// Identifier of a contract in the external contract store
pub type ContractId = Uuid;

/// Direction of a physical cargo contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalSide {
    Purchase,
    Sale,
}

/// Direction of a paper (futures / swap) contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaperSide {
    Long,
    Short,
}

/// What kind of contract a position projects. Both kinds reduce to the same
/// market exposure, so the risk calculator never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionKind {
    Physical {
        contract_id: ContractId,
        side: PhysicalSide,
    },
    Paper {
        contract_id: ContractId,
        side: PaperSide,
    },
}

impl PositionKind {
    pub fn contract_id(&self) -> ContractId {
        match self {
            PositionKind::Physical { contract_id, .. } => *contract_id,
            PositionKind::Paper { contract_id, .. } => *contract_id,
        }
    }

    /// +1 for purchases and longs, -1 for sales and shorts.
    pub fn sign(&self) -> i32 {
        match self {
            PositionKind::Physical {
                side: PhysicalSide::Purchase,
                ..
            }
            | PositionKind::Paper {
                side: PaperSide::Long,
                ..
            } => 1,
            PositionKind::Physical {
                side: PhysicalSide::Sale,
                ..
            }
            | PositionKind::Paper {
                side: PaperSide::Short,
                ..
            } => -1,
        }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, PositionKind::Physical { .. })
    }
}

/// Market-exposure projection of a position: everything the risk calculator
/// needs and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketExposure {
    /// Quantity with direction applied (negative = short).
    pub signed_quantity: Decimal,
    pub reference_price: Decimal,
    pub instrument: InstrumentKey,
}

impl MarketExposure {
    /// Signed notional value at the reference price.
    pub fn notional(&self) -> Decimal {
        self.signed_quantity * self.reference_price
    }
}

/// A weak reference to a contract in the external store, projected onto its
/// market exposure. The engine never owns contract data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRef {
    pub position_id: PositionId,
    pub kind: PositionKind,
    /// Unsigned quantity in base units (bbl, MT).
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Current mark used as the reference price for risk.
    pub mark_price: Decimal,
    pub instrument: InstrumentKey,
}

impl PositionRef {
    pub fn new(
        kind: PositionKind,
        quantity: Decimal,
        entry_price: Decimal,
        mark_price: Decimal,
        instrument: InstrumentKey,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4(),
            kind,
            quantity: quantity.abs(),
            entry_price,
            mark_price,
            instrument,
        }
    }

    pub fn paper(side: PaperSide, quantity: Decimal, entry: Decimal, mark: Decimal, instrument: &str) -> Self {
        Self::new(
            PositionKind::Paper {
                contract_id: Uuid::new_v4(),
                side,
            },
            quantity,
            entry,
            mark,
            InstrumentKey::new(instrument),
        )
    }

    pub fn physical(side: PhysicalSide, quantity: Decimal, entry: Decimal, mark: Decimal, instrument: &str) -> Self {
        Self::new(
            PositionKind::Physical {
                contract_id: Uuid::new_v4(),
                side,
            },
            quantity,
            entry,
            mark,
            InstrumentKey::new(instrument),
        )
    }

    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * Decimal::from(self.kind.sign())
    }

    pub fn market_exposure(&self) -> MarketExposure {
        MarketExposure {
            signed_quantity: self.signed_quantity(),
            reference_price: self.mark_price,
            instrument: self.instrument.clone(),
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.signed_quantity() * (self.mark_price - self.entry_price)
    }

    pub fn with_mark(mut self, mark_price: Decimal) -> Self {
        self.mark_price = mark_price;
        self
    }

    /// True when `other` describes the same position with only a different mark.
    pub fn differs_only_in_mark(&self, other: &PositionRef) -> bool {
        self.mark_price != other.mark_price
            && self.position_id == other.position_id
            && self.kind == other.kind
            && self.quantity == other.quantity
            && self.entry_price == other.entry_price
            && self.instrument == other.instrument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_paper_exposure_and_pnl() {
        let pos = PositionRef::paper(PaperSide::Long, dec!(1000), dec!(80), dec!(85), "BRENT");
        let exposure = pos.market_exposure();

        assert_eq!(exposure.signed_quantity, dec!(1000));
        assert_eq!(exposure.notional(), dec!(85000));
        assert_eq!(pos.unrealized_pnl(), dec!(5000));
    }

    #[test]
    fn test_physical_sale_is_short() {
        let pos = PositionRef::physical(PhysicalSide::Sale, dec!(500), dec!(90), dec!(85), "BRENT");

        assert_eq!(pos.signed_quantity(), dec!(-500));
        assert_eq!(pos.market_exposure().notional(), dec!(-42500));
        // Sold at 90, now 85: short gains 5 per bbl
        assert_eq!(pos.unrealized_pnl(), dec!(2500));
    }

    #[test]
    fn test_quantity_is_stored_unsigned() {
        let pos = PositionRef::paper(PaperSide::Short, dec!(-200), dec!(70), dec!(70), "WTI");
        assert_eq!(pos.quantity, dec!(200));
        assert_eq!(pos.signed_quantity(), dec!(-200));
    }

    #[test]
    fn test_differs_only_in_mark() {
        let pos = PositionRef::paper(PaperSide::Long, dec!(10), dec!(80), dec!(81), "BRENT");
        let repriced = pos.clone().with_mark(dec!(83));
        let mut amended = repriced.clone();
        amended.quantity = dec!(20);

        assert!(pos.differs_only_in_mark(&repriced));
        assert!(!pos.differs_only_in_mark(&amended));
        assert!(!pos.differs_only_in_mark(&pos));
    }
}
