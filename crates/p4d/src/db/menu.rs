use anyhow::{bail, Context, Result};

use super::Db;
use crate::params::{TimeRangeError, TimeRanges, SLOTS};
use crate::protocol::MenuEntry;

/// Cached display state of one controller menu node.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MenuItem {
    pub id: i64,
    pub parent: i64,
    #[sqlx(rename = "type")]
    pub kind: i64,
    pub address: i64,
    pub title: String,
    pub value: String,
    pub unit: String,
}

#[derive(sqlx::FromRow)]
struct TimeRangeRow {
    address: i64,
    from1: String,
    to1: String,
    from2: String,
    to2: String,
    from3: String,
    to3: String,
    from4: String,
    to4: String,
}

impl TimeRangeRow {
    fn into_ranges(self) -> Result<TimeRanges, TimeRangeError> {
        let address = u16::try_from(self.address).map_err(|_| TimeRangeError::Address(self.address))?;
        let mut t = TimeRanges::new(address);
        let windows = [
            (self.from1, self.to1),
            (self.from2, self.to2),
            (self.from3, self.to3),
            (self.from4, self.to4),
        ];
        for (i, (from, to)) in windows.iter().enumerate() {
            t.set_range(i, from, to)?;
        }
        Ok(t)
    }
}

impl Db {
    // ----------------------------
    // Menu
    // ----------------------------

    pub async fn menu_item(&self, id: i64) -> Result<Option<MenuItem>> {
        sqlx::query_as::<_, MenuItem>(
            "SELECT id, parent, type, address, title, value, unit FROM menu WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("menu_item failed")
    }

    pub async fn menu_items(&self) -> Result<Vec<MenuItem>> {
        sqlx::query_as::<_, MenuItem>(
            "SELECT id, parent, type, address, title, value, unit FROM menu ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("menu_items failed")
    }

    pub async fn count_menu_items(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM menu")
            .fetch_one(&self.pool)
            .await
            .context("count_menu_items failed")
    }

    pub async fn update_menu_value(&self, id: i64, value: &str, unit: &str) -> Result<()> {
        sqlx::query("UPDATE menu SET value = ?, unit = ? WHERE id = ?")
            .bind(value)
            .bind(unit)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("update_menu_value failed")?;
        Ok(())
    }

    /// Replace the whole menu tree with the controller's current one.
    pub async fn replace_menu(&self, entries: &[MenuEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("replace_menu begin failed")?;
        sqlx::query("DELETE FROM menu")
            .execute(&mut *tx)
            .await
            .context("replace_menu clear failed")?;
        for e in entries {
            sqlx::query(
                r#"
                INSERT INTO menu (id, parent, type, address, title, value, unit)
                VALUES (?, ?, ?, ?, ?, '', '')
                "#,
            )
            .bind(e.id)
            .bind(e.parent)
            .bind(e.kind as i64)
            .bind(e.address as i64)
            .bind(&e.title)
            .execute(&mut *tx)
            .await
            .context("replace_menu insert failed")?;
        }
        tx.commit().await.context("replace_menu commit failed")?;
        Ok(())
    }

    // ----------------------------
    // Time ranges
    // ----------------------------

    /// Stored windows of `address`. The inner error marks a row holding a
    /// cell that is neither `HH:MM` nor `nn:nn`.
    pub async fn time_ranges(&self, address: i64) -> Result<Option<Result<TimeRanges, TimeRangeError>>> {
        let row = sqlx::query_as::<_, TimeRangeRow>(
            r#"
            SELECT address, from1, to1, from2, to2, from3, to3, from4, to4
            FROM timeranges
            WHERE address = ?
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .context("time_ranges failed")?;
        Ok(row.map(TimeRangeRow::into_ranges))
    }

    /// Store all four windows of an address.
    pub async fn store_time_ranges(&self, t: &TimeRanges) -> Result<()> {
        let s = t.slots();
        sqlx::query(
            r#"
            INSERT INTO timeranges (address, from1, to1, from2, to2, from3, to3, from4, to4)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
              from1=excluded.from1, to1=excluded.to1,
              from2=excluded.from2, to2=excluded.to2,
              from3=excluded.from3, to3=excluded.to3,
              from4=excluded.from4, to4=excluded.to4
            "#,
        )
        .bind(t.address as i64)
        .bind(&s[0].from)
        .bind(&s[0].to)
        .bind(&s[1].from)
        .bind(&s[1].to)
        .bind(&s[2].from)
        .bind(&s[2].to)
        .bind(&s[3].from)
        .bind(&s[3].to)
        .execute(&self.pool)
        .await
        .context("store_time_ranges failed")?;
        Ok(())
    }

    /// Update a single window (1-based slot) and nothing else.
    pub async fn update_time_range_slot(&self, address: i64, slot: usize, from: &str, to: &str) -> Result<()> {
        if !(1..=SLOTS).contains(&slot) {
            bail!("time range slot {slot} out of range");
        }
        let sql = format!("UPDATE timeranges SET from{slot} = ?, to{slot} = ? WHERE address = ?");
        sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .bind(address)
            .execute(&self.pool)
            .await
            .context("update_time_range_slot failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, kind: u8, address: u16) -> MenuEntry {
        MenuEntry {
            id,
            parent: 0,
            kind,
            address,
            title: format!("item {id}"),
        }
    }

    #[tokio::test]
    async fn replace_menu_drops_old_rows() {
        let db = Db::memory().await;
        db.replace_menu(&[entry(1, 0x07, 0x10), entry(2, 0x0a, 0x12)]).await.unwrap();
        db.update_menu_value(1, "60", "°").await.unwrap();
        assert_eq!(db.menu_item(1).await.unwrap().unwrap().value, "60");

        db.replace_menu(&[entry(3, 0x07, 0x10)]).await.unwrap();
        assert_eq!(db.count_menu_items().await.unwrap(), 1);
        assert!(db.menu_item(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slot_update_touches_one_window() {
        let db = Db::memory().await;
        let mut t = TimeRanges::new(0x20);
        t.set_range(0, "05:00", "07:00").unwrap();
        t.set_range(2, "12:00", "13:00").unwrap();
        db.store_time_ranges(&t).await.unwrap();
        db.store_time_ranges(&TimeRanges::new(0x21)).await.unwrap();

        db.update_time_range_slot(0x20, 2, "06:00", "22:00").await.unwrap();

        let mut expected = t.clone();
        expected.set_range(1, "06:00", "22:00").unwrap();
        assert_eq!(db.time_ranges(0x20).await.unwrap().unwrap(), Ok(expected));
        assert_eq!(db.time_ranges(0x21).await.unwrap().unwrap(), Ok(TimeRanges::new(0x21)));

        assert!(db.update_time_range_slot(0x20, 5, "06:00", "22:00").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_time_range_row_is_reported() {
        let db = Db::memory().await;
        db.store_time_ranges(&TimeRanges::new(0x20)).await.unwrap();
        db.update_time_range_slot(0x20, 1, "5:00h", "08:00").await.unwrap();
        assert_eq!(
            db.time_ranges(0x20).await.unwrap().unwrap(),
            Err(TimeRangeError::Time("5:00h".into()))
        );

        sqlx::query("INSERT INTO timeranges (address, from1, to1, from2, to2, from3, to3, from4, to4) VALUES (70000, 'nn:nn', 'nn:nn', 'nn:nn', 'nn:nn', 'nn:nn', 'nn:nn', 'nn:nn', 'nn:nn')")
            .execute(&db.pool)
            .await
            .unwrap();
        assert_eq!(
            db.time_ranges(70000).await.unwrap().unwrap(),
            Err(TimeRangeError::Address(70000))
        );
    }
}
