//! Inventory ledger
//!
//! Stock moves by single commutative statements with no cross-item locking.
//! Decrements clamp at zero and never fail the caller for lack of stock; an
//! oversold product shows up in reporting rather than blocking a paid order.

use std::sync::Arc;
use tracing::{instrument, warn};

use crate::store::{Store, StoreTx};
use crate::Result;

#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn Store>,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn Store>) -> Self { Self { store } }

    /// Takes a sold line off the shelf. Returns the product that was charged, if any matched.
    #[instrument(skip(self, line), fields(product = %line.product_name))]
    pub async fn decrement_line(&self, line: StockLine) -> Result<Option<i64>> {
        let mut tx = self.store.begin().await?;
        let Some(product_id) = resolve(tx.as_mut(), &line).await? else {
            warn!(product = %line.product_name, "No product matches the sold line, stock unchanged");
            return Ok(None);
        };
        tx.decrement_stock(product_id, line.quantity).await?;
        tx.commit().await?;
        Ok(Some(product_id))
    }

    /// Restocks inside a caller's transaction so the stock change commits with it.
    pub async fn restock_in(tx: &mut dyn StoreTx, lines: Vec<StockLine>) -> Result<()> {
        for line in lines.into_iter().filter(|l| l.quantity > 0) {
            match resolve(tx, &line).await? {
                Some(product_id) => tx.increment_stock(product_id, line.quantity).await?,
                None => warn!(product = %line.product_name, qty = line.quantity, "No product matches the returned line, not restocked"),
            }
        }
        Ok(())
    }
}

/// One order or refund line as the ledger sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Option<i64>,
    pub product_name: String,
    pub quantity: i32,
}

/// Lines keep their product link until the product is deleted; after that the name is all that is left.
async fn resolve(tx: &mut dyn StoreTx, line: &StockLine) -> Result<Option<i64>> {
    match line.product_id {
        Some(id) => Ok(Some(id)),
        None => tx.product_id_by_name(&line.product_name).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use rust_decimal::Decimal;

    fn tea(quantity: i32) -> StockLine {
        StockLine { product_id: Some(1), product_name: "Tea".into(), quantity }
    }

    #[tokio::test]
    async fn test_concurrent_adjustments_commute() {
        let store = MemoryStore::new();
        store.put_product(1, "Tea", Decimal::new(400, 2), 50).await;
        let ledger = InventoryLedger::new(Arc::new(store.clone()));
        let mut handles = Vec::new();
        for i in 0..20 {
            let (ledger, store) = (ledger.clone(), store.clone());
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ledger.decrement_line(tea(3)).await.map(|_| ())
                } else {
                    let mut tx = store.begin().await.unwrap();
                    InventoryLedger::restock_in(tx.as_mut(), vec![tea(1)]).await.unwrap();
                    tx.commit().await
                }
            }));
        }
        for h in handles { h.await.unwrap().unwrap(); }
        assert_eq!(store.stock(1).await, Some(50 - 30 + 10));
    }

    #[tokio::test]
    async fn test_unlinked_lines_fall_back_to_product_name() {
        let store = MemoryStore::new();
        store.put_product(3, "Green Tea", Decimal::new(400, 2), 5).await;
        let ledger = InventoryLedger::new(Arc::new(store.clone()));
        let line = |quantity| StockLine { product_id: None, product_name: "green tea ".into(), quantity };

        assert_eq!(ledger.decrement_line(line(2)).await.unwrap(), Some(3));
        assert_eq!(store.stock(3).await, Some(3));

        let mut tx = store.begin().await.unwrap();
        InventoryLedger::restock_in(tx.as_mut(), vec![line(4), StockLine { product_id: None, product_name: "Gone".into(), quantity: 1 }])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.stock(3).await, Some(7));

        let missing = StockLine { product_id: None, product_name: "Gone".into(), quantity: 1 };
        assert_eq!(ledger.decrement_line(missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decrement_past_zero_is_not_an_error() {
        let store = MemoryStore::new();
        store.put_product(2, "Cup", Decimal::new(100, 2), 1).await;
        let ledger = InventoryLedger::new(Arc::new(store.clone()));
        let cup = |product_id, quantity| StockLine { product_id: Some(product_id), product_name: "Cup".into(), quantity };
        ledger.decrement_line(cup(2, 5)).await.unwrap();
        ledger.decrement_line(cup(99, 1)).await.unwrap();
        assert_eq!(store.stock(2).await, Some(0));
    }
}
