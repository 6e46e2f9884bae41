//! Down-sampling of raw samples with retention.

use anyhow::Result;
use tracing::info;

use crate::db::Db;

const DAY: i64 = 24 * 60 * 60;

/// Next aggregation instant after `now`, aligned to a multiple of
/// `interval_min` minutes. `None` while `history_days` is 0.
pub fn next_aggregate_at(now: i64, interval_min: i64, history_days: i64) -> Option<i64> {
    if history_days <= 0 {
        return None;
    }
    let step = interval_min.max(1) * 60;
    Some((now / step + 1) * step)
}

/// Condense raw samples older than `history_days` days into one average per
/// `interval_min` bucket. Returns (rows written, raw rows removed).
pub async fn aggregate(db: &Db, now: i64, interval_min: i64, history_days: i64) -> Result<(u64, u64)> {
    let before = now - history_days * DAY;
    let (written, removed) = db.aggregate_samples(before, interval_min * 60).await?;
    if removed > 0 {
        info!(written, removed, before, "samples aggregated");
    }
    Ok((written, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AGGREGATE_AVG, AGGREGATE_RAW, TYPE_VALUE};

    #[test]
    fn schedule_aligns_to_interval() {
        assert_eq!(next_aggregate_at(0, 15, 1), Some(900));
        assert_eq!(next_aggregate_at(899, 15, 1), Some(900));
        assert_eq!(next_aggregate_at(900, 15, 1), Some(1800));
        assert_eq!(next_aggregate_at(1000, 15, 0), None);
    }

    #[tokio::test]
    async fn old_samples_condensed_recent_kept() {
        let db = Db::memory().await;
        let now = 100 * DAY;
        let old = now - 3 * DAY;
        // Two samples in one 15 min bucket, one in the next.
        let base = (old / 900) * 900;
        db.insert_sample(base + 10, TYPE_VALUE, 1, 10.0, 1, None).await.unwrap();
        db.insert_sample(base + 70, TYPE_VALUE, 1, 20.0, 1, None).await.unwrap();
        db.insert_sample(base + 910, TYPE_VALUE, 1, 40.0, 1, None).await.unwrap();
        db.insert_sample(now - 60, TYPE_VALUE, 1, 50.0, 1, None).await.unwrap();

        let (written, removed) = aggregate(&db, now, 15, 2).await.unwrap();
        assert_eq!((written, removed), (2, 3));

        let rows = db.samples_for(TYPE_VALUE, 1).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].aggregate, AGGREGATE_AVG);
        assert_eq!(rows[0].time, base);
        assert_eq!(rows[0].value, 15.0);
        assert_eq!(rows[0].samples, 2);
        assert_eq!(rows[1].value, 40.0);
        assert_eq!(rows[2].aggregate, AGGREGATE_RAW);

        // Nothing left to condense.
        assert_eq!(aggregate(&db, now, 15, 2).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn bucket_straddling_cutoff_condensed_once() {
        let db = Db::memory().await;
        let bucket = 100 * DAY;
        for (offset, value) in [(10, 10.0), (40, 30.0), (70, 50.0)] {
            db.insert_sample(bucket + offset, TYPE_VALUE, 1, value, 1, None).await.unwrap();
        }

        // Cutoff lands 30s into the bucket: it is not complete yet.
        assert_eq!(aggregate(&db, bucket + DAY + 30, 15, 1).await.unwrap(), (0, 0));
        // One interval later the whole bucket goes at once.
        assert_eq!(aggregate(&db, bucket + DAY + 905, 15, 1).await.unwrap(), (1, 3));

        let rows = db.samples_for(TYPE_VALUE, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, bucket);
        assert_eq!(rows[0].aggregate, AGGREGATE_AVG);
        assert_eq!(rows[0].value, 30.0);
        assert_eq!(rows[0].samples, 3);
    }
}
