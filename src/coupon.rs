use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::utils::{now_utc, random_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `discount_value` is a percentage, 1..=100
    Percentage,
    /// `discount_value` is an amount in cents
    Fixed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_uses: Option<i64>,
    pub max_uses_per_user: Option<i64>,
    pub used_count: i64,
    pub min_purchase: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Courses the coupon is restricted to; empty means it applies everywhere
    #[sqlx(skip)]
    pub course_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CouponInput {
    /// Generated when omitted
    pub code: Option<String>,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_uses: Option<i64>,
    pub max_uses_per_user: Option<i64>,
    pub min_purchase: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub course_ids: Vec<i64>,
}

/// Result of checking a coupon against a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AppliedCoupon {
    pub coupon_id: i64,
    pub code: String,
    pub price: i64,
    pub discount: i64,
    pub final_price: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct CouponUsage {
    pub id: i64,
    pub user_id: i64,
    pub user_email: String,
    pub order_id: Option<i64>,
    pub enrollment_id: Option<i64>,
    pub discount_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
}

/// Amount taken off `price`. Never more than the price itself.
pub fn discount_amount(kind: DiscountType, value: i64, price: i64) -> i64 {
    if price <= 0 || value <= 0 {
        return 0;
    }
    let amount = match kind {
        DiscountType::Percentage => price * value.min(100) / 100,
        DiscountType::Fixed => value.min(price),
    };
    amount.clamp(0, price)
}

pub fn final_price(price: i64, discount: i64) -> i64 {
    (price - discount).max(0)
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub fn generate_code() -> String {
    random_code(10)
}

pub fn validate_input(input: &CouponInput) -> Result<()> {
    let bad = |msg: &str| Err(Error::BadRequest(msg.to_string()));
    if let Some(code) = &input.code {
        let code = normalize_code(code);
        if !(3..=32).contains(&code.len())
            || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return bad("Coupon code must be 3-32 letters, digits or dashes");
        }
    }
    match input.discount_type {
        DiscountType::Percentage if !(1..=100).contains(&input.discount_value) => {
            return bad("Percentage discount must be between 1 and 100");
        }
        DiscountType::Fixed if input.discount_value <= 0 => {
            return bad("Fixed discount must be positive");
        }
        _ => {}
    }
    if input.max_uses.is_some_and(|n| n < 1) || input.max_uses_per_user.is_some_and(|n| n < 1) {
        return bad("Usage limits must be at least 1");
    }
    if let (Some(max), Some(per_user)) = (input.max_uses, input.max_uses_per_user) {
        if per_user > max {
            return bad("Per-user limit cannot exceed the global limit");
        }
    }
    if input.min_purchase.is_some_and(|m| m < 0) {
        return bad("Minimum purchase cannot be negative");
    }
    if let (Some(start), Some(end)) = (input.starts_at, input.expires_at) {
        if start >= end {
            return bad("Coupon must start before it expires");
        }
    }
    Ok(())
}

const COUPON_COLUMNS: &str = "id, code, description, discount_type, discount_value, max_uses,
    max_uses_per_user, used_count, min_purchase, starts_at, expires_at, is_active, created_at";

async fn load_course_ids(executor: impl SqliteExecutor<'_>, coupon: &mut Coupon) -> Result<()> {
    coupon.course_ids =
        sqlx::query_scalar("SELECT course_id FROM course_coupons WHERE coupon_id = ? ORDER BY course_id")
            .bind(coupon.id)
            .fetch_all(executor)
            .await?;
    Ok(())
}

pub fn get<'a>(database: impl Acquire<'a, Database = Sqlite> + Send + 'a, id: i64) -> impl Future<Output = Result<Coupon>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let mut coupon: Coupon =
        sqlx::query_as(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::not_found(format!("Coupon {id}")))?;
    load_course_ids(&mut *conn, &mut coupon).await?;
    Ok(coupon)
    }
}

pub async fn get_by_code(database: &SqlitePool, code: &str) -> Result<Coupon> {
    let code = normalize_code(code);
    let mut coupon: Coupon =
        sqlx::query_as(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE code = ?"))
            .bind(&code)
            .fetch_optional(database)
            .await?
            .ok_or_else(|| Error::not_found(format!("Coupon {code}")))?;
    load_course_ids(database, &mut coupon).await?;
    Ok(coupon)
}

pub async fn list(database: &SqlitePool) -> Result<Vec<Coupon>> {
    let mut coupons: Vec<Coupon> =
        sqlx::query_as(&format!("SELECT {COUPON_COLUMNS} FROM coupons ORDER BY id DESC"))
            .fetch_all(database)
            .await?;
    for coupon in &mut coupons {
        load_course_ids(database, coupon).await?;
    }
    Ok(coupons)
}

async fn replace_courses(conn: &mut SqliteConnection, id: i64, course_ids: &[i64]) -> Result<()> {
    sqlx::query("DELETE FROM course_coupons WHERE coupon_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    for course_id in course_ids {
        sqlx::query("INSERT OR IGNORE INTO course_coupons (coupon_id, course_id) VALUES (?, ?)")
            .bind(id)
            .bind(course_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub fn create<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    admin_id: Option<i64>,
    input: CouponInput,
) -> impl Future<Output = Result<Coupon>> + Send + 'a {
    async move {
    validate_input(&input)?;
    let code = input
        .code
        .as_deref()
        .map(normalize_code)
        .unwrap_or_else(generate_code);
    let mut tx = database.begin().await?;
    let id = sqlx::query(
        "INSERT INTO coupons (code, description, discount_type, discount_value, max_uses,
                              max_uses_per_user, min_purchase, starts_at, expires_at, created_by,
                              created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&code)
    .bind(&input.description)
    .bind(input.discount_type)
    .bind(input.discount_value)
    .bind(input.max_uses)
    .bind(input.max_uses_per_user)
    .bind(input.min_purchase)
    .bind(input.starts_at)
    .bind(input.expires_at)
    .bind(admin_id)
    .bind(now_utc())
    .execute(&mut *tx)
    .await
    .map_err(|e| match Error::from(e) {
        Error::Conflict(_) => Error::Conflict(format!("Coupon {code} already exists")),
        other => other,
    })?
    .last_insert_rowid();
    replace_courses(&mut tx, id, &input.course_ids).await?;
    let created = get(&mut *tx, id).await?;
    tx.commit().await?;
    info!("created coupon {} ({})", id, code);
    Ok(created)
    }
}

/// Update the rules of a coupon. Its code never changes, and the discount itself is frozen
/// once the coupon has been redeemed.
pub fn update<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
    input: CouponInput,
) -> impl Future<Output = Result<Coupon>> + Send + 'a {
    async move {
    validate_input(&input)?;
    let mut tx = database.begin().await?;
    let current = get(&mut *tx, id).await?;
    if current.used_count > 0
        && (current.discount_type != input.discount_type
            || current.discount_value != input.discount_value)
    {
        return Err(Error::Conflict(
            "Discount of a redeemed coupon cannot change".to_string(),
        ));
    }
    if input.max_uses.is_some_and(|max| max < current.used_count) {
        return Err(Error::BadRequest(format!(
            "Coupon was already used {} times",
            current.used_count
        )));
    }
    sqlx::query(
        "UPDATE coupons SET description = ?, discount_type = ?, discount_value = ?, max_uses = ?,
                max_uses_per_user = ?, min_purchase = ?, starts_at = ?, expires_at = ?
         WHERE id = ?",
    )
    .bind(&input.description)
    .bind(input.discount_type)
    .bind(input.discount_value)
    .bind(input.max_uses)
    .bind(input.max_uses_per_user)
    .bind(input.min_purchase)
    .bind(input.starts_at)
    .bind(input.expires_at)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    replace_courses(&mut tx, id, &input.course_ids).await?;
    let updated = get(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(updated)
    }
}

pub async fn set_active(executor: impl SqliteExecutor<'_>, id: i64, active: bool) -> Result<()> {
    let result = sqlx::query("UPDATE coupons SET is_active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("Coupon {id}")));
    }
    Ok(())
}

pub fn set_courses<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
    course_ids: &'a [i64],
) -> impl Future<Output = Result<Coupon>> + Send + 'a {
    async move {
    let mut tx = database.begin().await?;
    get(&mut *tx, id).await?;
    replace_courses(&mut tx, id, course_ids).await?;
    let updated = get(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(updated)
    }
}

/// Used coupons are kept for the records; deactivate them instead.
pub fn delete<'a>(database: impl Acquire<'a, Database = Sqlite> + Send + 'a, id: i64) -> impl Future<Output = Result<()>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let coupon = get(&mut *conn, id).await?;
    if coupon.used_count > 0 {
        return Err(Error::Conflict(format!(
            "Coupon {} has been used; deactivate it instead",
            coupon.code
        )));
    }
    sqlx::query("DELETE FROM coupons WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
    }
}

async fn uses_by_user(conn: &mut SqliteConnection, coupon_id: i64, user_id: i64) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM coupon_usages WHERE coupon_id = ? AND user_id = ?",
    )
    .bind(coupon_id)
    .bind(user_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// Rules that do not depend on the database: activity, window, global cap, scope and
/// minimum purchase.
pub fn check_rules(coupon: &Coupon, course_id: i64, price: i64, now: OffsetDateTime) -> Result<()> {
    let invalid = |msg: String| Err(Error::BadRequest(msg));
    if !coupon.is_active {
        return invalid(format!("Coupon {} is not active", coupon.code));
    }
    if coupon.starts_at.is_some_and(|start| now < start) {
        return invalid(format!("Coupon {} is not valid yet", coupon.code));
    }
    if coupon.expires_at.is_some_and(|end| now >= end) {
        return invalid(format!("Coupon {} has expired", coupon.code));
    }
    if coupon.max_uses.is_some_and(|max| coupon.used_count >= max) {
        return invalid(format!("Coupon {} has reached its usage limit", coupon.code));
    }
    if !coupon.course_ids.is_empty() && !coupon.course_ids.contains(&course_id) {
        return invalid(format!("Coupon {} does not apply to this course", coupon.code));
    }
    if coupon.min_purchase.is_some_and(|min| price < min) {
        return invalid(format!(
            "Coupon {} requires a minimum purchase",
            coupon.code
        ));
    }
    Ok(())
}

/// Validate `code` for `user_id` buying `course_id` at `price` and compute the discount.
pub async fn check(
    database: &SqlitePool,
    code: &str,
    user_id: i64,
    course_id: i64,
    price: i64,
) -> Result<AppliedCoupon> {
    let coupon = get_by_code(database, code).await?;
    check_rules(&coupon, course_id, price, now_utc())?;
    if let Some(per_user) = coupon.max_uses_per_user {
        let mut conn = database.acquire().await?;
        if uses_by_user(&mut conn, coupon.id, user_id).await? >= per_user {
            return Err(Error::BadRequest(format!(
                "You have already used coupon {}",
                coupon.code
            )));
        }
    }
    let discount = discount_amount(coupon.discount_type, coupon.discount_value, price);
    Ok(AppliedCoupon {
        coupon_id: coupon.id,
        code: coupon.code,
        price,
        discount,
        final_price: final_price(price, discount),
    })
}

/// Consume one use of a checked coupon inside the caller's transaction. The global cap is
/// enforced by the conditional update, so two racing redemptions cannot both succeed.
pub async fn redeem(
    conn: &mut SqliteConnection,
    applied: &AppliedCoupon,
    user_id: i64,
    order_id: Option<i64>,
    enrollment_id: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE coupons SET used_count = used_count + 1
         WHERE id = ? AND is_active = 1 AND (max_uses IS NULL OR used_count < max_uses)",
    )
    .bind(applied.coupon_id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "Coupon {} is no longer available",
            applied.code
        )));
    }
    let per_user: Option<i64> =
        sqlx::query_scalar("SELECT max_uses_per_user FROM coupons WHERE id = ?")
            .bind(applied.coupon_id)
            .fetch_one(&mut *conn)
            .await?;
    if let Some(per_user) = per_user {
        if uses_by_user(conn, applied.coupon_id, user_id).await? >= per_user {
            return Err(Error::Conflict(format!(
                "You have already used coupon {}",
                applied.code
            )));
        }
    }
    sqlx::query(
        "INSERT INTO coupon_usages (coupon_id, user_id, order_id, enrollment_id, discount_amount,
                                    used_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(applied.coupon_id)
    .bind(user_id)
    .bind(order_id)
    .bind(enrollment_id)
    .bind(applied.discount)
    .bind(now_utc())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Give back the coupon use reserved by an order that will not be paid.
pub async fn release(conn: &mut SqliteConnection, order_id: i64) -> Result<()> {
    let usages: Vec<i64> =
        sqlx::query_scalar("SELECT coupon_id FROM coupon_usages WHERE order_id = ?")
            .bind(order_id)
            .fetch_all(&mut *conn)
            .await?;
    for coupon_id in usages {
        sqlx::query("UPDATE coupons SET used_count = MAX(used_count - 1, 0) WHERE id = ?")
            .bind(coupon_id)
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query("DELETE FROM coupon_usages WHERE order_id = ?")
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn usage_report(database: &SqlitePool, id: i64) -> Result<Vec<CouponUsage>> {
    get(database, id).await?;
    let usages = sqlx::query_as(
        "SELECT cu.id, cu.user_id, u.email AS user_email, cu.order_id, cu.enrollment_id,
                cu.discount_amount, cu.used_at
         FROM coupon_usages cu JOIN users u ON u.id = cu.user_id
         WHERE cu.coupon_id = ? ORDER BY cu.id",
    )
    .bind(id)
    .fetch_all(database)
    .await?;
    Ok(usages)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{course, db, user};
    use time::Duration;

    pub(crate) fn input(kind: DiscountType, value: i64) -> CouponInput {
        CouponInput {
            code: Some("SAVE-NOW".to_string()),
            description: None,
            discount_type: kind,
            discount_value: value,
            max_uses: None,
            max_uses_per_user: None,
            min_purchase: None,
            starts_at: None,
            expires_at: None,
            course_ids: vec![],
        }
    }

    #[test]
    fn percentage_never_exceeds_price() {
        assert_eq!(discount_amount(DiscountType::Percentage, 25, 10_000), 2_500);
        assert_eq!(discount_amount(DiscountType::Percentage, 100, 10_000), 10_000);
        assert_eq!(discount_amount(DiscountType::Percentage, 150, 10_000), 10_000);
        assert_eq!(discount_amount(DiscountType::Percentage, 33, 999), 329);
    }

    #[test]
    fn fixed_never_goes_negative() {
        assert_eq!(discount_amount(DiscountType::Fixed, 500, 2_000), 500);
        assert_eq!(discount_amount(DiscountType::Fixed, 5_000, 2_000), 2_000);
        assert_eq!(final_price(2_000, discount_amount(DiscountType::Fixed, 5_000, 2_000)), 0);
        assert_eq!(discount_amount(DiscountType::Fixed, 500, 0), 0);
        assert_eq!(final_price(100, 250), 0);
    }

    #[test]
    fn input_validation() {
        assert!(validate_input(&input(DiscountType::Percentage, 100)).is_ok());
        assert!(validate_input(&input(DiscountType::Percentage, 101)).is_err());
        assert!(validate_input(&input(DiscountType::Percentage, 0)).is_err());
        assert!(validate_input(&input(DiscountType::Fixed, 0)).is_err());
        let now = now_utc();
        assert!(validate_input(&CouponInput {
            starts_at: Some(now),
            expires_at: Some(now - Duration::days(1)),
            ..input(DiscountType::Fixed, 100)
        })
        .is_err());
        assert!(validate_input(&CouponInput {
            max_uses: Some(1),
            max_uses_per_user: Some(2),
            ..input(DiscountType::Fixed, 100)
        })
        .is_err());
        assert!(validate_input(&CouponInput {
            code: Some("no spaces".to_string()),
            ..input(DiscountType::Fixed, 100)
        })
        .is_err());
    }

    #[tokio::test]
    async fn check_enforces_window_scope_and_minimum() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (scoped, _) = course::tests::published(&database, professor, "Scoped", 5000, 1).await;
        let (other, _) = course::tests::published(&database, professor, "Other", 5000, 1).await;
        let now = now_utc();

        create(
            &database,
            None,
            CouponInput {
                code: Some("scoped".to_string()),
                course_ids: vec![scoped],
                min_purchase: Some(1000),
                ..input(DiscountType::Percentage, 20)
            },
        )
        .await
        .unwrap();
        let applied = check(&database, "SCOPED", student, scoped, 5000).await.unwrap();
        assert_eq!(applied.discount, 1000);
        assert_eq!(applied.final_price, 4000);
        assert!(check(&database, "scoped", student, other, 5000).await.is_err());
        assert!(check(&database, "scoped", student, scoped, 500).await.is_err());

        create(
            &database,
            None,
            CouponInput {
                code: Some("EXPIRED".to_string()),
                starts_at: Some(now - Duration::days(10)),
                expires_at: Some(now - Duration::days(1)),
                ..input(DiscountType::Fixed, 100)
            },
        )
        .await
        .unwrap();
        create(
            &database,
            None,
            CouponInput {
                code: Some("LATER".to_string()),
                starts_at: Some(now + Duration::days(1)),
                ..input(DiscountType::Fixed, 100)
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            check(&database, "expired", student, other, 5000).await.unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(check(&database, "later", student, other, 5000).await.is_err());
        assert!(matches!(
            check(&database, "missing", student, other, 5000).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn redeem_respects_caps() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let a = user::tests::student(&database, "a@example.com").await;
        let b = user::tests::student(&database, "b@example.com").await;
        let c = user::tests::student(&database, "c@example.com").await;
        let (course_id, _) = course::tests::published(&database, professor, "Caps", 5000, 1).await;
        let coupon = create(
            &database,
            None,
            CouponInput {
                max_uses: Some(2),
                max_uses_per_user: Some(1),
                ..input(DiscountType::Fixed, 700)
            },
        )
        .await
        .unwrap();

        let applied = check(&database, &coupon.code, a, course_id, 5000).await.unwrap();
        let mut conn = database.acquire().await.unwrap();
        redeem(&mut conn, &applied, a, None, None).await.unwrap();
        drop(conn);
        assert!(check(&database, &coupon.code, a, course_id, 5000).await.is_err());

        let applied_b = check(&database, &coupon.code, b, course_id, 5000).await.unwrap();
        let applied_c = check(&database, &coupon.code, c, course_id, 5000).await.unwrap();
        let mut conn = database.acquire().await.unwrap();
        redeem(&mut conn, &applied_b, b, None, None).await.unwrap();
        // c checked before b redeemed, but the cap still holds
        assert!(matches!(
            redeem(&mut conn, &applied_c, c, None, None).await.unwrap_err(),
            Error::Conflict(_)
        ));
        drop(conn);

        assert_eq!(get(&database, coupon.id).await.unwrap().used_count, 2);
        let usages = usage_report(&database, coupon.id).await.unwrap();
        assert_eq!(usages.len(), 2);
        assert_eq!(usages[0].user_email, "a@example.com");
        assert!(matches!(delete(&database, coupon.id).await.unwrap_err(), Error::Conflict(_)));
        assert!(matches!(
            update(&database, coupon.id, input(DiscountType::Fixed, 900)).await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn generated_codes_and_deactivation() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, _) = course::tests::published(&database, professor, "Gen", 5000, 1).await;
        let coupon = create(
            &database,
            None,
            CouponInput {
                code: None,
                ..input(DiscountType::Percentage, 10)
            },
        )
        .await
        .unwrap();
        assert_eq!(coupon.code.len(), 10);
        set_active(&database, coupon.id, false).await.unwrap();
        assert!(check(&database, &coupon.code, student, course_id, 5000).await.is_err());
        delete(&database, coupon.id).await.unwrap();
        assert!(list(&database).await.unwrap().is_empty());
    }
}
