//! Postgres store backed by sqlx

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::fmt::Display;
use std::str::FromStr;

use crate::domain::aggregates::{
    CartLine, NewOrder, NewOrderItem, NewRefund, NewRefundItem, Order, OrderItem, PaymentTransaction, ProviderRef,
    ProviderRefs, Refund, RefundEvidence, RefundItem, RefundTransaction, RefundUsage, UserProfile,
};
use crate::domain::status::OrderStatus;
use crate::store::{Store, StoreTx};
use crate::{EcommerceError, Result};

const ORDER_COLUMNS: &str = "id, user_id, total, shipping_fee, payment_method, delivery_type, contact_name, contact_phone, address, pickup_code, pickup_code_status, pickup_code_redeemed_at, payment_intent_id, wallet_order_id, wallet_capture_id, qr_retrieval_ref, qr_course_init_id, status, cancelled_at, created_at";
const REFUND_COLUMNS: &str = "id, order_id, user_id, refund_type, reason, note, preferred_method, status, admin_id, admin_note, rejection_reason, approved_at, rejected_at, processed_at, refunded_at, failed_reason, shipping_refund, created_at";
const REFUND_ITEM_COLUMNS: &str = "id, refund_id, order_item_id, product_id, product_name, qty_requested, qty_approved, unit_price, line_refund_amount";

#[derive(Clone)]
pub struct PgStore { pool: PgPool }

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        Ok(Box::new(PgTx { tx: self.pool.begin().await? }))
    }
}

pub struct PgTx { tx: Transaction<'static, Postgres> }

fn parse<T: FromStr>(field: &str, raw: &str) -> Result<T>
where
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| EcommerceError::Corrupt(format!("{field}: {e}")))
}

fn unique_violation(err: sqlx::Error) -> EcommerceError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            EcommerceError::Conflict(db.constraint().unwrap_or("unique key").to_string())
        }
        _ => EcommerceError::Storage(err),
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64, user_id: i64, total: Decimal, shipping_fee: Decimal, payment_method: String, delivery_type: String,
    contact_name: Option<String>, contact_phone: Option<String>, address: Option<String>,
    pickup_code: Option<String>, pickup_code_status: Option<String>, pickup_code_redeemed_at: Option<DateTime<Utc>>,
    payment_intent_id: Option<String>, wallet_order_id: Option<String>, wallet_capture_id: Option<String>,
    qr_retrieval_ref: Option<String>, qr_course_init_id: Option<String>,
    status: String, cancelled_at: Option<DateTime<Utc>>, created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = EcommerceError;

    fn try_from(r: OrderRow) -> Result<Self> {
        Ok(Order {
            id: r.id,
            user_id: r.user_id,
            total: r.total,
            shipping_fee: r.shipping_fee,
            payment_method: parse("orders.payment_method", &r.payment_method)?,
            delivery_type: parse("orders.delivery_type", &r.delivery_type)?,
            contact_name: r.contact_name,
            contact_phone: r.contact_phone,
            address: r.address,
            pickup_code: r.pickup_code,
            pickup_code_status: r.pickup_code_status.as_deref().map(|s| parse("orders.pickup_code_status", s)).transpose()?,
            pickup_code_redeemed_at: r.pickup_code_redeemed_at,
            refs: ProviderRefs {
                payment_intent_id: r.payment_intent_id,
                wallet_order_id: r.wallet_order_id,
                wallet_capture_id: r.wallet_capture_id,
                qr_retrieval_ref: r.qr_retrieval_ref,
                qr_course_init_id: r.qr_course_init_id,
            },
            status: parse("orders.status", &r.status)?,
            cancelled_at: r.cancelled_at,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: i64, order_id: i64, user_id: i64, refund_type: String, reason: String, note: Option<String>,
    preferred_method: String, status: String, admin_id: Option<i64>, admin_note: Option<String>,
    rejection_reason: Option<String>, approved_at: Option<DateTime<Utc>>, rejected_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>, refunded_at: Option<DateTime<Utc>>, failed_reason: Option<String>,
    shipping_refund: Decimal, created_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = EcommerceError;

    fn try_from(r: RefundRow) -> Result<Self> {
        Ok(Refund {
            id: r.id,
            order_id: r.order_id,
            user_id: r.user_id,
            refund_type: parse("refunds.refund_type", &r.refund_type)?,
            reason: parse("refunds.reason", &r.reason)?,
            note: r.note,
            preferred_method: parse("refunds.preferred_method", &r.preferred_method)?,
            status: parse("refunds.status", &r.status)?,
            admin_id: r.admin_id,
            admin_note: r.admin_note,
            rejection_reason: r.rejection_reason,
            approved_at: r.approved_at,
            rejected_at: r.rejected_at,
            processed_at: r.processed_at,
            refunded_at: r.refunded_at,
            failed_reason: r.failed_reason,
            shipping_refund: r.shipping_refund,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundItemRow {
    id: i64, refund_id: i64, order_item_id: i64, product_id: Option<i64>, product_name: String,
    qty_requested: i32, qty_approved: i32, unit_price: Decimal, line_refund_amount: Decimal,
}

impl From<RefundItemRow> for RefundItem {
    fn from(r: RefundItemRow) -> Self {
        RefundItem {
            id: r.id, refund_id: r.refund_id, order_item_id: r.order_item_id, product_id: r.product_id,
            product_name: r.product_name, qty_requested: r.qty_requested, qty_approved: r.qty_approved,
            unit_price: r.unit_price, line_refund_amount: r.line_refund_amount,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RefundTxnRow {
    refund_id: i64, provider: String, provider_ref: Option<String>, amount: Decimal, currency: String,
    txn_status: String, raw_response: Option<serde_json::Value>,
}

#[derive(sqlx::FromRow)]
struct PaymentTxnRow {
    order_id: i64, provider: String, reference: String, amount: Decimal, currency: String, status: String,
    created_at: DateTime<Utc>,
}

impl PgTx {
    async fn fetch_order(&mut self, sql: String, bind: &str) -> Result<Option<Order>> {
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(bind)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    async fn fetch_order_by_id(&mut self, order_id: i64, lock: bool) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{}", if lock { " FOR UPDATE" } else { "" });
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    async fn fetch_refund(&mut self, refund_id: i64, lock: bool) -> Result<Option<Refund>> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE id = $1{}", if lock { " FOR UPDATE" } else { "" });
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(refund_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Refund::try_from)
            .transpose()
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn user_profile(&mut self, user_id: i64) -> Result<Option<UserProfile>> {
        let row: Option<(i64, Option<String>, Option<String>, Option<String>, bool)> =
            sqlx::query_as("SELECT id, name, phone, address, membership_active FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(|(id, name, phone, address, membership_active)| UserProfile { id, name, phone, address, membership_active }))
    }

    async fn cart_lines(&mut self, user_id: i64) -> Result<Vec<CartLine>> {
        let rows: Vec<(i64, String, Decimal, i32)> = sqlx::query_as(
            "SELECT p.id, p.name, p.price, c.quantity FROM cart_items c JOIN products p ON p.id = c.product_id WHERE c.user_id = $1 ORDER BY p.id",
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(product_id, product_name, unit_price, quantity)| CartLine { product_id, product_name, unit_price, quantity })
            .collect())
    }

    async fn clear_cart_products(&mut self, user_id: i64, product_ids: &[i64]) -> Result<u64> {
        if product_ids.is_empty() { return Ok(0); }
        let res = sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND product_id = ANY($2)")
            .bind(user_id)
            .bind(product_ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }

    async fn decrement_stock(&mut self, product_id: i64, qty: i32) -> Result<()> {
        sqlx::query("UPDATE products SET stock = GREATEST(stock - $2, 0) WHERE id = $1")
            .bind(product_id)
            .bind(qty)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_stock(&mut self, product_id: i64, qty: i32) -> Result<()> {
        sqlx::query("UPDATE products SET stock = stock + $2 WHERE id = $1")
            .bind(product_id)
            .bind(qty)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn product_id_by_name(&mut self, name: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE LOWER(name) = LOWER($1) ORDER BY id LIMIT 1")
            .bind(name.trim())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn insert_order(&mut self, o: &NewOrder) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO orders (user_id, total, shipping_fee, payment_method, delivery_type, contact_name, contact_phone, address, pickup_code, pickup_code_status, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW()) RETURNING id",
        )
        .bind(o.user_id)
        .bind(o.total)
        .bind(o.shipping_fee)
        .bind(o.payment_method.as_str())
        .bind(o.delivery_type.as_str())
        .bind(&o.contact_name)
        .bind(&o.contact_phone)
        .bind(&o.address)
        .bind(&o.pickup_code)
        .bind(o.pickup_code.as_ref().map(|_| "active"))
        .bind(o.status.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(unique_violation)?;
        Ok(id)
    }

    async fn insert_order_items(&mut self, order_id: i64, items: &[NewOrderItem]) -> Result<()> {
        if items.is_empty() { return Ok(()); }
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO order_items (order_id, product_id, product_name, quantity, unit_price) ");
        qb.push_values(items, |mut b, item| {
            b.push_bind(order_id)
                .push_bind(item.product_id)
                .push_bind(item.product_name.clone())
                .push_bind(item.quantity)
                .push_bind(item.unit_price);
        });
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn order(&mut self, order_id: i64) -> Result<Option<Order>> {
        self.fetch_order_by_id(order_id, false).await
    }

    async fn order_for_update(&mut self, order_id: i64) -> Result<Option<Order>> {
        self.fetch_order_by_id(order_id, true).await
    }

    async fn order_by_ref(&mut self, reference: &ProviderRef) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {} = $1", reference.kind().column());
        self.fetch_order(sql, reference.value()).await
    }

    async fn order_by_pickup_code(&mut self, code: &str) -> Result<Option<Order>> {
        self.fetch_order(format!("SELECT {ORDER_COLUMNS} FROM orders WHERE pickup_code = $1"), code).await
    }

    async fn order_items(&mut self, order_id: i64) -> Result<Vec<OrderItem>> {
        let rows: Vec<(i64, i64, Option<i64>, String, i32, Decimal)> = sqlx::query_as(
            "SELECT id, order_id, product_id, product_name, quantity, unit_price FROM order_items WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, order_id, product_id, product_name, quantity, unit_price)| OrderItem { id, order_id, product_id, product_name, quantity, unit_price })
            .collect())
    }

    async fn pickup_code_exists(&mut self, code: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM orders WHERE pickup_code = $1)")
            .bind(code)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    async fn update_order_status(&mut self, order_id: i64, status: OrderStatus) -> Result<()> {
        let res = sqlx::query(
            "UPDATE orders SET status = $2, cancelled_at = CASE WHEN $3 THEN NOW() ELSE cancelled_at END WHERE id = $1",
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(status.is_cancelled())
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() == 0 { return Err(EcommerceError::NotFound("order")); }
        Ok(())
    }

    async fn set_provider_ref(&mut self, order_id: i64, reference: &ProviderRef) -> Result<bool> {
        let col = reference.kind().column();
        let sql = format!("UPDATE orders SET {col} = $2 WHERE id = $1 AND ({col} IS NULL OR {col} = $2)");
        let res = sqlx::query(&sql)
            .bind(order_id)
            .bind(reference.value())
            .execute(&mut *self.tx)
            .await
            .map_err(unique_violation)?;
        Ok(res.rows_affected() == 1)
    }

    async fn redeem_pickup(&mut self, order_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE orders SET pickup_code_status = 'redeemed', status = 'completed', pickup_code_redeemed_at = $2 WHERE id = $1")
            .bind(order_id)
            .bind(at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_order(&mut self, order_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM payment_transactions WHERE order_id = $1").bind(order_id).execute(&mut *self.tx).await?;
        sqlx::query("DELETE FROM order_items WHERE order_id = $1").bind(order_id).execute(&mut *self.tx).await?;
        sqlx::query("DELETE FROM orders WHERE id = $1").bind(order_id).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_payment_transaction(&mut self, t: &PaymentTransaction) -> Result<()> {
        sqlx::query("INSERT INTO payment_transactions (order_id, provider, reference, amount, currency, status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)")
            .bind(t.order_id)
            .bind(t.provider.as_str())
            .bind(&t.reference)
            .bind(t.amount)
            .bind(&t.currency)
            .bind(&t.status)
            .bind(t.created_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn payment_transactions(&mut self, order_id: i64) -> Result<Vec<PaymentTransaction>> {
        let rows = sqlx::query_as::<_, PaymentTxnRow>(
            "SELECT order_id, provider, reference, amount, currency, status, created_at FROM payment_transactions WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(PaymentTransaction {
                    order_id: r.order_id,
                    provider: parse("payment_transactions.provider", &r.provider)?,
                    reference: r.reference,
                    amount: r.amount,
                    currency: r.currency,
                    status: r.status,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    async fn insert_refund(&mut self, r: &NewRefund) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO refunds (order_id, user_id, refund_type, reason, note, preferred_method, status, admin_id, approved_at, shipping_refund, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW()) RETURNING id",
        )
        .bind(r.order_id)
        .bind(r.user_id)
        .bind(r.refund_type.as_str())
        .bind(r.reason.as_str())
        .bind(&r.note)
        .bind(r.preferred_method.as_str())
        .bind(r.status.as_str())
        .bind(r.admin_id)
        .bind(r.approved_at)
        .bind(r.shipping_refund)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_refund_items(&mut self, refund_id: i64, items: &[NewRefundItem]) -> Result<()> {
        if items.is_empty() { return Ok(()); }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO refund_items (refund_id, order_item_id, product_id, product_name, qty_requested, qty_approved, unit_price, line_refund_amount) ",
        );
        qb.push_values(items, |mut b, item| {
            b.push_bind(refund_id)
                .push_bind(item.order_item_id)
                .push_bind(item.product_id)
                .push_bind(item.product_name.clone())
                .push_bind(item.qty_requested)
                .push_bind(item.qty_approved)
                .push_bind(item.unit_price)
                .push_bind(item.line_refund_amount());
        });
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_refund_evidence(&mut self, refund_id: i64, evidence: &[RefundEvidence]) -> Result<()> {
        if evidence.is_empty() { return Ok(()); }
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO refund_evidence (refund_id, file_ref, content_type) ");
        qb.push_values(evidence, |mut b, e| {
            b.push_bind(refund_id).push_bind(e.file_ref.clone()).push_bind(e.content_type.clone());
        });
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn refund(&mut self, refund_id: i64) -> Result<Option<Refund>> {
        self.fetch_refund(refund_id, false).await
    }

    async fn refund_for_update(&mut self, refund_id: i64) -> Result<Option<Refund>> {
        self.fetch_refund(refund_id, true).await
    }

    async fn refund_items(&mut self, refund_id: i64) -> Result<Vec<RefundItem>> {
        let sql = format!("SELECT {REFUND_ITEM_COLUMNS} FROM refund_items WHERE refund_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, RefundItemRow>(&sql).bind(refund_id).fetch_all(&mut *self.tx).await?;
        Ok(rows.into_iter().map(RefundItem::from).collect())
    }

    async fn refund_evidence(&mut self, refund_id: i64) -> Result<Vec<RefundEvidence>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT file_ref, content_type FROM refund_evidence WHERE refund_id = $1 ORDER BY id")
                .bind(refund_id)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(rows.into_iter().map(|(file_ref, content_type)| RefundEvidence { file_ref, content_type }).collect())
    }

    async fn update_refund(&mut self, r: &Refund) -> Result<()> {
        sqlx::query(
            "UPDATE refunds SET status = $2, admin_id = $3, admin_note = $4, rejection_reason = $5, approved_at = $6, \
             rejected_at = $7, processed_at = $8, refunded_at = $9, failed_reason = $10 WHERE id = $1",
        )
        .bind(r.id)
        .bind(r.status.as_str())
        .bind(r.admin_id)
        .bind(&r.admin_note)
        .bind(&r.rejection_reason)
        .bind(r.approved_at)
        .bind(r.rejected_at)
        .bind(r.processed_at)
        .bind(r.refunded_at)
        .bind(&r.failed_reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_refund_item_approved(&mut self, refund_item_id: i64, qty_approved: i32, line_amount: Decimal) -> Result<()> {
        sqlx::query("UPDATE refund_items SET qty_approved = $2, line_refund_amount = $3 WHERE id = $1")
            .bind(refund_item_id)
            .bind(qty_approved)
            .bind(line_amount)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn refunds_for_order(&mut self, order_id: i64) -> Result<Vec<Refund>> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE order_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, RefundRow>(&sql).bind(order_id).fetch_all(&mut *self.tx).await?;
        rows.into_iter().map(Refund::try_from).collect()
    }

    async fn refund_usage(&mut self, order_id: i64) -> Result<Vec<RefundUsage>> {
        let rows: Vec<(i64, String, i64, i32, i32)> = sqlx::query_as(
            "SELECT r.id, r.status, ri.order_item_id, ri.qty_requested, ri.qty_approved \
             FROM refund_items ri JOIN refunds r ON r.id = ri.refund_id WHERE r.order_id = $1",
        )
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter()
            .map(|(refund_id, status, order_item_id, qty_requested, qty_approved)| {
                Ok(RefundUsage { refund_id, status: parse("refunds.status", &status)?, order_item_id, qty_requested, qty_approved })
            })
            .collect()
    }

    async fn upsert_refund_transaction(&mut self, t: &RefundTransaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO refund_transactions (refund_id, provider, provider_ref, amount, currency, txn_status, raw_response, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
             ON CONFLICT (refund_id) DO UPDATE SET provider = EXCLUDED.provider, provider_ref = COALESCE(EXCLUDED.provider_ref, refund_transactions.provider_ref), \
             amount = EXCLUDED.amount, currency = EXCLUDED.currency, txn_status = EXCLUDED.txn_status, raw_response = EXCLUDED.raw_response, updated_at = NOW()",
        )
        .bind(t.refund_id)
        .bind(&t.provider)
        .bind(&t.provider_ref)
        .bind(t.amount)
        .bind(&t.currency)
        .bind(t.txn_status.as_str())
        .bind(&t.raw_response)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn refund_transaction(&mut self, refund_id: i64) -> Result<Option<RefundTransaction>> {
        let row = sqlx::query_as::<_, RefundTxnRow>(
            "SELECT refund_id, provider, provider_ref, amount, currency, txn_status, raw_response FROM refund_transactions WHERE refund_id = $1",
        )
        .bind(refund_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| {
            Ok(RefundTransaction {
                refund_id: r.refund_id,
                provider: r.provider,
                provider_ref: r.provider_ref,
                amount: r.amount,
                currency: r.currency,
                txn_status: parse("refund_transactions.txn_status", &r.txn_status)?,
                raw_response: r.raw_response,
            })
        })
        .transpose()
    }

    async fn settled_refund_total(&mut self, order_id: i64, excluding_refund: i64) -> Result<Decimal> {
        let (total,): (Option<Decimal>,) = sqlx::query_as(
            "SELECT SUM(t.amount) FROM refund_transactions t JOIN refunds r ON r.id = t.refund_id \
             WHERE r.order_id = $1 AND t.refund_id <> $2 AND t.txn_status = 'completed'",
        )
        .bind(order_id)
        .bind(excluding_refund)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    async fn webhook_event_seen(&mut self, provider: &str, event_id: &str) -> Result<bool> {
        let seen: Option<i32> = sqlx::query_scalar("SELECT 1 FROM processed_webhook_events WHERE provider = $1 AND event_id = $2")
            .bind(provider)
            .bind(event_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(seen.is_some())
    }

    async fn record_webhook_event(&mut self, provider: &str, event_id: &str) -> Result<bool> {
        let res = sqlx::query("INSERT INTO processed_webhook_events (provider, event_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(provider)
            .bind(event_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}
