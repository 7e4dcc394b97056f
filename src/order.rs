use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::coupon::{self, AppliedCoupon};
use crate::course;
use crate::enrollment::{self, NewEnrollment};
use crate::error::{Error, Result};
use crate::utils::{now_utc, random_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub user_id: i64,
    pub coupon_id: Option<i64>,
    pub subtotal: i64,
    pub discount: i64,
    pub total: i64,
    pub status: OrderStatus,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct OrderItem {
    pub id: i64,
    pub course_id: i64,
    pub course_title: String,
    pub price: i64,
    pub discount: i64,
    pub final_price: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub provider: String,
    pub reference: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Checkout {
    pub order: OrderDetail,
    /// Reference to hand to the payment provider; absent when nothing is owed
    pub payment_reference: Option<String>,
    /// Set when the order was settled immediately
    pub enrollment_id: Option<i64>,
}

/// Callback sent by the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentEvent {
    pub reference: String,
    pub status: PaymentEventStatus,
    pub amount: i64,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PaymentEventStatus {
    Succeeded,
    Failed,
}

const ORDER_COLUMNS: &str = "id, order_number, user_id, coupon_id, subtotal, discount, total,
    status, failure_reason, created_at, updated_at";

pub async fn get_order(database: &SqlitePool, id: i64) -> Result<OrderDetail> {
    let order: Order = sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"))
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| Error::not_found(format!("Order {id}")))?;
    let items = sqlx::query_as(
        "SELECT oi.id, oi.course_id, c.title AS course_title, oi.price, oi.discount, oi.final_price
         FROM order_items oi JOIN courses c ON c.id = oi.course_id
         WHERE oi.order_id = ? ORDER BY oi.id",
    )
    .bind(id)
    .fetch_all(database)
    .await?;
    let payments = sqlx::query_as(
        "SELECT id, order_id, provider, reference, amount, status, failure_reason, created_at,
                updated_at
         FROM payments WHERE order_id = ? ORDER BY id",
    )
    .bind(id)
    .fetch_all(database)
    .await?;
    Ok(OrderDetail {
        order,
        items,
        payments,
    })
}

/// Fetch an order on behalf of its buyer.
pub async fn get_for_user(database: &SqlitePool, user_id: i64, id: i64) -> Result<OrderDetail> {
    let detail = get_order(database, id).await?;
    if detail.order.user_id != user_id {
        return Err(Error::not_found(format!("Order {id}")));
    }
    Ok(detail)
}

pub async fn list_for_user(database: &SqlitePool, user_id: i64) -> Result<Vec<Order>> {
    let orders = sqlx::query_as(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = ? ORDER BY id DESC"
    ))
    .bind(user_id)
    .fetch_all(database)
    .await?;
    Ok(orders)
}

pub async fn list_all(database: &SqlitePool, status: Option<OrderStatus>) -> Result<Vec<Order>> {
    let orders = sqlx::query_as(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC"
    ))
    .bind(status)
    .fetch_all(database)
    .await?;
    Ok(orders)
}

fn not_pending(order_id: i64) -> Error {
    Error::Conflict(format!("Order {order_id} is no longer pending"))
}

/// Move a pending order to a terminal state and give back its coupon use.
/// An order settled in the meantime is left alone.
async fn close_order(
    conn: &mut SqliteConnection,
    order_id: i64,
    status: OrderStatus,
    reason: &str,
) -> Result<()> {
    let now = now_utc();
    let result = sqlx::query(
        "UPDATE orders SET status = ?, failure_reason = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(status)
    .bind(reason)
    .bind(now)
    .bind(order_id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(not_pending(order_id));
    }
    sqlx::query(
        "UPDATE payments SET status = 'failed', failure_reason = ?, updated_at = ?
         WHERE order_id = ? AND status = 'pending'",
    )
    .bind(reason)
    .bind(now)
    .bind(order_id)
    .execute(&mut *conn)
    .await?;
    coupon::release(conn, order_id).await
}

/// Enroll the buyer of a paid order, attaching the reserved coupon use to the enrollment.
async fn fulfil(conn: &mut SqliteConnection, order_id: i64) -> Result<i64> {
    let (user_id, coupon_id, course_id, final_price): (i64, Option<i64>, i64, i64) =
        sqlx::query_as(
            "SELECT o.user_id, o.coupon_id, oi.course_id, oi.final_price
             FROM orders o JOIN order_items oi ON oi.order_id = o.id
             WHERE o.id = ?",
        )
        .bind(order_id)
        .fetch_one(&mut *conn)
        .await?;
    let result = sqlx::query(
        "UPDATE orders SET status = 'paid', updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(now_utc())
    .bind(order_id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(not_pending(order_id));
    }
    let enrollment_id = enrollment::create_in_tx(
        conn,
        &NewEnrollment {
            user_id,
            course_id,
            coupon_id,
            order_id: Some(order_id),
            price_paid: final_price,
            expires_at: None,
        },
    )
    .await?;
    sqlx::query("UPDATE coupon_usages SET enrollment_id = ? WHERE order_id = ?")
        .bind(enrollment_id)
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
    Ok(enrollment_id)
}

/// Start buying a paid course. Orders fully covered by a coupon settle immediately;
/// otherwise a pending payment is opened with `provider`.
pub async fn checkout(
    database: &SqlitePool,
    provider: &str,
    user_id: i64,
    course_id: i64,
    coupon_code: Option<&str>,
) -> Result<Checkout> {
    let course = course::get(database, course_id).await?;
    if !course.is_published {
        return Err(Error::not_found(format!("Course {course_id}")));
    }
    if course.is_free {
        return Err(Error::BadRequest(
            "This course is free; enroll directly".to_string(),
        ));
    }
    if enrollment::get_active(database, user_id, course_id)
        .await?
        .is_some()
    {
        return Err(Error::Conflict("Already enrolled in this course".to_string()));
    }
    let applied: Option<AppliedCoupon> = match coupon_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => Some(coupon::check(database, code, user_id, course_id, course.price).await?),
        None => None,
    };
    let discount = applied.as_ref().map_or(0, |a| a.discount);
    let total = coupon::final_price(course.price, discount);
    let now = now_utc();

    let mut tx = database.begin().await?;
    // an abandoned checkout for the same course must not keep a coupon reserved
    let stale: Vec<i64> = sqlx::query_scalar(
        "SELECT o.id FROM orders o JOIN order_items oi ON oi.order_id = o.id
         WHERE o.user_id = ? AND oi.course_id = ? AND o.status = 'pending'",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_all(&mut *tx)
    .await?;
    for id in stale {
        close_order(&mut tx, id, OrderStatus::Cancelled, "superseded by a new checkout").await?;
    }

    let order_number = format!("ORD-{}", random_code(12));
    let order_id = sqlx::query(
        "INSERT INTO orders (order_number, user_id, coupon_id, subtotal, discount, total,
                             created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&order_number)
    .bind(user_id)
    .bind(applied.as_ref().map(|a| a.coupon_id))
    .bind(course.price)
    .bind(discount)
    .bind(total)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();
    sqlx::query(
        "INSERT INTO order_items (order_id, course_id, price, discount, final_price)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(order_id)
    .bind(course_id)
    .bind(course.price)
    .bind(discount)
    .bind(total)
    .execute(&mut *tx)
    .await?;
    if let Some(applied) = &applied {
        coupon::redeem(&mut tx, applied, user_id, Some(order_id), None).await?;
    }

    let (payment_reference, enrollment_id) = if total == 0 {
        (None, Some(fulfil(&mut tx, order_id).await?))
    } else {
        let reference = format!("pay_{}", random_code(24).to_lowercase());
        sqlx::query(
            "INSERT INTO payments (order_id, provider, reference, amount, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(order_id)
        .bind(provider)
        .bind(&reference)
        .bind(total)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        (Some(reference), None)
    };
    tx.commit().await?;
    info!(
        "order {} for course {} by user {}: total {}",
        order_number, course_id, user_id, total
    );
    Ok(Checkout {
        order: get_order(database, order_id).await?,
        payment_reference,
        enrollment_id,
    })
}

/// Apply a provider callback. Replaying a success is harmless.
pub async fn complete_payment(database: &SqlitePool, event: PaymentEvent) -> Result<OrderDetail> {
    let payment: Payment = sqlx::query_as(
        "SELECT id, order_id, provider, reference, amount, status, failure_reason, created_at,
                updated_at
         FROM payments WHERE reference = ?",
    )
    .bind(&event.reference)
    .fetch_optional(database)
    .await?
    .ok_or_else(|| Error::not_found(format!("Payment {}", event.reference)))?;

    match (payment.status, event.status) {
        (PaymentStatus::Succeeded, PaymentEventStatus::Succeeded) => {
            return get_order(database, payment.order_id).await;
        }
        (PaymentStatus::Pending, _) => {}
        (status, _) => {
            return Err(Error::Conflict(format!(
                "Payment {} is already {:?}",
                payment.reference, status
            )));
        }
    }

    if event.status == PaymentEventStatus::Succeeded && event.amount != payment.amount {
        return Err(Error::BadRequest(format!(
            "Paid amount {} does not match {}",
            event.amount, payment.amount
        )));
    }

    let now = now_utc();
    let mut tx = database.begin().await?;
    match event.status {
        PaymentEventStatus::Succeeded => {
            let result = sqlx::query(
                "UPDATE payments SET status = 'succeeded', updated_at = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(payment.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(Error::Conflict(format!(
                    "Payment {} is no longer pending",
                    payment.reference
                )));
            }
            let enrollment_id = fulfil(&mut tx, payment.order_id).await?;
            info!(
                "payment {} succeeded, enrollment {}",
                payment.reference, enrollment_id
            );
        }
        PaymentEventStatus::Failed => {
            let reason = event
                .failure_reason
                .as_deref()
                .unwrap_or("payment failed");
            close_order(&mut tx, payment.order_id, OrderStatus::Failed, reason).await?;
            warn!("payment {} failed: {}", payment.reference, reason);
        }
    }
    tx.commit().await?;
    get_order(database, payment.order_id).await
}

/// Buyer abandons a pending order.
pub async fn cancel(database: &SqlitePool, user_id: i64, id: i64) -> Result<OrderDetail> {
    let detail = get_for_user(database, user_id, id).await?;
    if detail.order.status != OrderStatus::Pending {
        return Err(Error::Conflict(format!(
            "Order {} is {:?} and cannot be cancelled",
            detail.order.order_number, detail.order.status
        )));
    }
    let mut tx = database.begin().await?;
    close_order(&mut tx, id, OrderStatus::Cancelled, "cancelled by buyer").await?;
    tx.commit().await?;
    get_order(database, id).await
}
