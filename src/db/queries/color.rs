//! Color legend queries

use sqlx::PgPool;

use crate::types::ColorMeaning;

/// Upsert legend rows; returns how many were newly inserted
pub async fn sync_color_meanings(
    pool: &PgPool,
    rows: &[ColorMeaning],
) -> Result<usize, sqlx::Error> {
    let mut added = 0;
    for row in rows {
        let result = sqlx::query(
            r#"
            INSERT INTO color_meanings (rgb_hex, meaning)
            VALUES ($1, $2)
            ON CONFLICT (rgb_hex) DO UPDATE SET meaning = EXCLUDED.meaning
            "#,
        )
        .bind(&row.rgb_hex)
        .bind(&row.meaning)
        .execute(pool)
        .await?;

        // rows_affected is 1 for an insert, 2 when an existing row was updated
        if result.rows_affected() == 1 {
            added += 1;
        }
    }
    Ok(added)
}
