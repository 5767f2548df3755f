//! Line-item master and current-projection table operations

use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::db::StoreError;
use crate::models::line_item::{BusinessLine, PriceKind};
use crate::models::LineItemRow;

/// Append line items to the master table. Rows already present for
/// (card_id, line_index) are left untouched.
pub async fn insert_master(
    pool: &SqlitePool,
    card_id: &str,
    rows: &[LineItemRow],
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for item in rows {
        insert_row(&mut tx, "line_items_master", card_id, item, true).await?;
    }
    tx.commit().await?;
    tracing::debug!(card_id = %card_id, count = rows.len(), "Inserted line items to master");
    Ok(())
}

/// Atomically replace the full current line-item set for a card.
///
/// Readers observe either the old complete set or the new one, never a
/// partial merge.
pub async fn replace_current(
    pool: &SqlitePool,
    card_id: &str,
    rows: &[LineItemRow],
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM line_items_current WHERE card_id = ?")
        .bind(card_id)
        .execute(&mut *tx)
        .await?;
    for item in rows {
        insert_row(&mut tx, "line_items_current", card_id, item, false).await?;
    }
    tx.commit().await?;
    tracing::debug!(card_id = %card_id, count = rows.len(), "Replaced current line items");
    Ok(())
}

async fn insert_row(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    card_id: &str,
    item: &LineItemRow,
    ignore_existing: bool,
) -> Result<(), StoreError> {
    let verb = if ignore_existing {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let sql = format!(
        r#"
        {verb} INTO {table} (
            card_id, line_index, quantity, raw_price, price_kind,
            unit_price, total_revenue, description, business_line, material, dimensions
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#
    );
    sqlx::query(&sql)
        .bind(card_id)
        .bind(item.line_index)
        .bind(item.quantity)
        .bind(item.raw_price)
        .bind(item.price_kind.as_str())
        .bind(item.unit_price)
        .bind(item.total_revenue)
        .bind(&item.description)
        .bind(item.business_line.map(|b| b.as_str()))
        .bind(&item.material)
        .bind(&item.dimensions)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Current line items for a card, ordered by line index.
pub async fn get_current(
    pool: &SqlitePool,
    card_id: &str,
) -> Result<Vec<LineItemRow>, StoreError> {
    let rows = sqlx::query(
        "SELECT * FROM line_items_current WHERE card_id = ? ORDER BY line_index ASC",
    )
    .bind(card_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LineItemRow {
            line_index: row.get("line_index"),
            quantity: row.get("quantity"),
            raw_price: row.get("raw_price"),
            price_kind: PriceKind::parse(&row.get::<String, _>("price_kind")),
            unit_price: row.get("unit_price"),
            total_revenue: row.get("total_revenue"),
            description: row.get("description"),
            business_line: row
                .get::<Option<String>, _>("business_line")
                .as_deref()
                .and_then(BusinessLine::parse),
            material: row.get("material"),
            dimensions: row.get("dimensions"),
        })
        .collect())
}
