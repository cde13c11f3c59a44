//! Transaction type dispatch
//!
//! Field 4 of every export line is a numeric transaction type code. Codes map
//! to a [`TransactionKind`]; kinds map to exactly one physical table. Alias
//! codes (free-price vs catalog registration, sum vs percent discounts, and so
//! on) are simply several catalogue rows pointing at the same kind.
//!
//! Unknown codes are a hard error. There is no fallback table.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::schema::{SchemaError, SchemaRegistry, TableSchema};

/// Canonical logical kind of a transaction line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransactionKind {
    ItemRegistration,
    ItemStorno,
    ItemRefund,
    ItemRefundStorno,
    ItemCorrection,
    ItemTax,
    ItemTaxStorno,
    PositionDiscount,
    PositionDiscountStorno,
    DocumentDiscount,
    DocumentDiscountStorno,
    DistributedDiscount,
    DistributedDiscountStorno,
    BonusAccrual,
    BonusWriteOff,
    CardRegistration,
    CardStorno,
    Payment,
    PaymentStorno,
    PaymentRefund,
    DocumentOpen,
    DocumentSubtotal,
    DocumentCloseKkm,
    DocumentClose,
    DocumentDeferred,
    DocumentCancel,
    CashIn,
    CashOut,
    XReport,
    ZReport,
    ShiftOpen,
    ShiftClose,
    MarkingCode,
    MarkingStorno,
    KkmError,
    ServiceEvent,
}

impl TransactionKind {
    /// Physical table this kind is written to
    pub fn table_name(self) -> &'static str {
        match self {
            TransactionKind::ItemRegistration => "tx_item_registration",
            TransactionKind::ItemStorno => "tx_item_storno",
            TransactionKind::ItemRefund => "tx_item_refund",
            TransactionKind::ItemRefundStorno => "tx_item_refund_storno",
            TransactionKind::ItemCorrection => "tx_item_correction",
            TransactionKind::ItemTax => "tx_item_tax",
            TransactionKind::ItemTaxStorno => "tx_item_tax_storno",
            TransactionKind::PositionDiscount => "tx_position_discount",
            TransactionKind::PositionDiscountStorno => "tx_position_discount_storno",
            TransactionKind::DocumentDiscount => "tx_document_discount",
            TransactionKind::DocumentDiscountStorno => "tx_document_discount_storno",
            TransactionKind::DistributedDiscount => "tx_distributed_discount",
            TransactionKind::DistributedDiscountStorno => "tx_distributed_discount_storno",
            TransactionKind::BonusAccrual => "tx_bonus_accrual",
            TransactionKind::BonusWriteOff => "tx_bonus_writeoff",
            TransactionKind::CardRegistration => "tx_card_registration",
            TransactionKind::CardStorno => "tx_card_storno",
            TransactionKind::Payment => "tx_payment",
            TransactionKind::PaymentStorno => "tx_payment_storno",
            TransactionKind::PaymentRefund => "tx_payment_refund",
            TransactionKind::DocumentOpen => "tx_document_open",
            TransactionKind::DocumentSubtotal => "tx_document_subtotal",
            TransactionKind::DocumentCloseKkm => "tx_document_close_kkm",
            TransactionKind::DocumentClose => "tx_document_close",
            TransactionKind::DocumentDeferred => "tx_document_deferred",
            TransactionKind::DocumentCancel => "tx_document_cancel",
            TransactionKind::CashIn => "tx_cash_in",
            TransactionKind::CashOut => "tx_cash_out",
            TransactionKind::XReport => "tx_x_report",
            TransactionKind::ZReport => "tx_z_report",
            TransactionKind::ShiftOpen => "tx_shift_open",
            TransactionKind::ShiftClose => "tx_shift_close",
            TransactionKind::MarkingCode => "tx_marking",
            TransactionKind::MarkingStorno => "tx_marking_storno",
            TransactionKind::KkmError => "tx_kkm_error",
            TransactionKind::ServiceEvent => "tx_service_event",
        }
    }
}

/// One supported transaction type code
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SupportedType {
    pub code: i64,
    pub kind: TransactionKind,
    pub description: &'static str,
}

const fn supported(code: i64, kind: TransactionKind, description: &'static str) -> SupportedType {
    SupportedType {
        code,
        kind,
        description,
    }
}

/// Every transaction type code the decoder accepts
pub const SUPPORTED_TRANSACTION_TYPES: &[SupportedType] = &[
    supported(1, TransactionKind::ItemRegistration, "Item registration at free price"),
    supported(2, TransactionKind::ItemStorno, "Item storno at free price"),
    supported(4, TransactionKind::ItemTax, "Tax on item"),
    supported(5, TransactionKind::ItemTaxStorno, "Tax on item storno"),
    supported(7, TransactionKind::ItemCorrection, "Item quantity correction"),
    supported(9, TransactionKind::BonusAccrual, "Bonus accrual"),
    supported(10, TransactionKind::BonusWriteOff, "Bonus write-off"),
    supported(11, TransactionKind::ItemRegistration, "Item registration from catalog"),
    supported(12, TransactionKind::ItemStorno, "Item storno from catalog"),
    supported(13, TransactionKind::ItemRefund, "Item refund"),
    supported(14, TransactionKind::ItemRefundStorno, "Item refund storno"),
    supported(15, TransactionKind::PositionDiscount, "Position discount by sum"),
    supported(16, TransactionKind::PositionDiscountStorno, "Position discount by sum storno"),
    supported(17, TransactionKind::PositionDiscount, "Position discount by percent"),
    supported(18, TransactionKind::PositionDiscountStorno, "Position discount by percent storno"),
    supported(20, TransactionKind::CardRegistration, "Client card registration"),
    supported(21, TransactionKind::CardStorno, "Client card storno"),
    supported(35, TransactionKind::DocumentDiscount, "Document discount by sum"),
    supported(36, TransactionKind::DocumentDiscountStorno, "Document discount by sum storno"),
    supported(37, TransactionKind::DocumentDiscount, "Document discount by percent"),
    supported(38, TransactionKind::DocumentDiscountStorno, "Document discount by percent storno"),
    supported(40, TransactionKind::Payment, "Payment with customer amount"),
    supported(41, TransactionKind::Payment, "Payment without customer amount"),
    supported(42, TransactionKind::DocumentOpen, "Document open"),
    supported(43, TransactionKind::PaymentStorno, "Payment storno"),
    supported(44, TransactionKind::PaymentRefund, "Payment refund"),
    supported(45, TransactionKind::DocumentCloseKkm, "Document closed in fiscal register"),
    supported(49, TransactionKind::DocumentCloseKkm, "Document closed in fiscal register without print"),
    supported(50, TransactionKind::CashIn, "Cash in"),
    supported(51, TransactionKind::CashOut, "Cash out"),
    supported(55, TransactionKind::DocumentClose, "Document close"),
    supported(56, TransactionKind::DocumentDeferred, "Document deferred"),
    supported(57, TransactionKind::DocumentSubtotal, "Document subtotal"),
    supported(58, TransactionKind::DocumentCancel, "Document cancelled"),
    supported(60, TransactionKind::XReport, "Report without closing (X report)"),
    supported(61, TransactionKind::ZReport, "Report with closing (Z report)"),
    supported(62, TransactionKind::ShiftOpen, "Shift open"),
    supported(63, TransactionKind::ShiftClose, "Shift close"),
    supported(64, TransactionKind::KkmError, "Fiscal register error"),
    supported(65, TransactionKind::ServiceEvent, "Service event"),
    supported(66, TransactionKind::ServiceEvent, "Cashier login"),
    supported(67, TransactionKind::ServiceEvent, "Cashier logout"),
    supported(85, TransactionKind::DistributedDiscount, "Document discount distributed to position"),
    supported(86, TransactionKind::DistributedDiscountStorno, "Distributed discount storno"),
    supported(87, TransactionKind::DistributedDiscount, "Bonus payment distributed to position"),
    supported(120, TransactionKind::MarkingCode, "Marking code registration"),
    supported(121, TransactionKind::MarkingStorno, "Marking code storno"),
    supported(122, TransactionKind::MarkingCode, "Marking code on refund"),
];

/// Whether a code appears in the supported catalogue
pub fn is_supported(code: i64) -> bool {
    SUPPORTED_TRANSACTION_TYPES.iter().any(|t| t.code == code)
}

/// Destination of a decoded line
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub code: i64,
    pub kind: TransactionKind,
    pub table: &'static str,
    pub schema: &'static TableSchema,
}

/// Resolves type codes to tables and schemas
#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: HashMap<i64, Route>,
    registry: Arc<SchemaRegistry>,
}

impl Dispatcher {
    /// Build the routing table from the supported catalogue.
    ///
    /// Fails if any kind points at a table the registry does not know.
    pub fn new(registry: Arc<SchemaRegistry>) -> Result<Self, SchemaError> {
        let mut routes = HashMap::with_capacity(SUPPORTED_TRANSACTION_TYPES.len());

        for supported in SUPPORTED_TRANSACTION_TYPES {
            let table = supported.kind.table_name();
            let schema = registry.lookup(table)?;
            routes.insert(
                supported.code,
                Route {
                    code: supported.code,
                    kind: supported.kind,
                    table,
                    schema,
                },
            );
        }

        Ok(Self { routes, registry })
    }

    pub fn resolve(&self, code: i64) -> Result<Route, DecodeError> {
        self.routes
            .get(&code)
            .copied()
            .ok_or(DecodeError::UnsupportedType(code))
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(SchemaRegistry::builtin())).unwrap()
    }

    #[test]
    fn test_resolve_registration() {
        let route = dispatcher().resolve(1).unwrap();
        assert_eq!(route.kind, TransactionKind::ItemRegistration);
        assert_eq!(route.table, "tx_item_registration");
        assert_eq!(route.schema.name, "tx_item_registration");
    }

    #[test]
    fn test_resolve_unsupported() {
        let err = dispatcher().resolve(9999).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedType(9999)));
        assert!(matches!(dispatcher().resolve(0), Err(DecodeError::UnsupportedType(0))));
        assert!(!is_supported(9999));
    }

    #[test]
    fn test_catalogue_covers_registry() {
        let registry = SchemaRegistry::builtin();
        assert!(SUPPORTED_TRANSACTION_TYPES.len() >= registry.len());

        let reachable: HashSet<_> = SUPPORTED_TRANSACTION_TYPES
            .iter()
            .map(|t| t.kind.table_name())
            .collect();
        for schema in registry.tables() {
            assert!(reachable.contains(schema.name), "{} has no type code", schema.name);
        }
    }

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<_> = SUPPORTED_TRANSACTION_TYPES.iter().map(|t| t.code).collect();
        assert_eq!(codes.len(), SUPPORTED_TRANSACTION_TYPES.len());
    }

    #[test]
    fn test_alias_codes_share_table() {
        let d = dispatcher();
        assert_eq!(d.resolve(1).unwrap().table, d.resolve(11).unwrap().table);
        assert_eq!(d.resolve(40).unwrap().table, d.resolve(41).unwrap().table);
        assert_eq!(d.resolve(45).unwrap().table, d.resolve(49).unwrap().table);
    }

    #[test]
    fn test_alias_codes_decode_identically() {
        let d = dispatcher();
        let line = |code: &str| format!("77;01.12.2024;10:30:00;{};001;100;1;ITEM001;GR1;10,50;2;21,00", code);

        let free = line("1");
        let catalog = line("11");
        let free_fields: Vec<&str> = free.split(';').collect();
        let catalog_fields: Vec<&str> = catalog.split(';').collect();

        let a = crate::decode::decode(d.resolve(1).unwrap().schema, &free_fields, "T01/main").record;
        let b = crate::decode::decode(d.resolve(11).unwrap().schema, &catalog_fields, "T01/main").record;

        assert_eq!(a.table, b.table);
        assert_eq!(a.values.len(), b.values.len());
        assert_eq!(a.text("item_identifier"), b.text("item_identifier"));
        assert_eq!(a.float("position_sum"), b.float("position_sum"));
        assert_eq!(a.int("transaction_type"), Some(1));
        assert_eq!(b.int("transaction_type"), Some(11));
    }

    #[test]
    fn test_storno_uses_registration_layout_in_own_table() {
        let d = dispatcher();
        let registration = d.resolve(11).unwrap();
        let storno = d.resolve(12).unwrap();
        assert_ne!(registration.table, storno.table);
        assert!(registration.schema.same_layout(storno.schema));
    }
}
