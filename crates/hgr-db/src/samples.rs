use chrono::{DateTime, Utc};

use hgr_types::{HangarError, LoadSample, Result};

use crate::connection::MetricsStore;

/// Repository for host load samples.
pub struct SampleRepository<'a> {
    store: &'a MetricsStore,
}

impl<'a> SampleRepository<'a> {
    pub fn new(store: &'a MetricsStore) -> Self {
        Self { store }
    }

    pub async fn record(&self, sample: &LoadSample) -> Result<()> {
        sqlx::query(
            "INSERT INTO samples (timestamp, load_one, load_five, load_fifteen, mem_used, mem_total)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(sample.timestamp.to_rfc3339())
        .bind(sample.load_one)
        .bind(sample.load_five)
        .bind(sample.load_fifteen)
        .bind(clamp_i64(sample.mem_used))
        .bind(clamp_i64(sample.mem_total))
        .execute(self.store.pool())
        .await
        .map_err(|e| HangarError::Database(format!("Record sample: {e}")))?;

        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM samples")
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| HangarError::Database(format!("Count samples: {e}")))?;
        Ok(row.0)
    }

    /// All samples in recording order.
    pub async fn all(&self) -> Result<Vec<LoadSample>> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            "SELECT timestamp, load_one, load_five, load_fifteen, mem_used, mem_total
             FROM samples ORDER BY id",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| HangarError::Database(format!("Get samples: {e}")))?;

        rows.into_iter().map(SampleRow::into_sample).collect()
    }
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    timestamp: String,
    load_one: f64,
    load_five: f64,
    load_fifteen: f64,
    mem_used: i64,
    mem_total: i64,
}

impl SampleRow {
    fn into_sample(self) -> Result<LoadSample> {
        Ok(LoadSample {
            timestamp: parse_timestamp(&self.timestamp)?,
            load_one: self.load_one,
            load_five: self.load_five,
            load_fifteen: self.load_fifteen,
            mem_used: self.mem_used.max(0) as u64,
            mem_total: self.mem_total.max(0) as u64,
        })
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HangarError::Database(format!("Bad timestamp {raw}: {e}")))
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_read_back() {
        let store = MetricsStore::in_memory().await.unwrap();
        let repo = SampleRepository::new(&store);

        let sample = LoadSample {
            timestamp: Utc::now(),
            load_one: 0.5,
            load_five: 0.25,
            load_fifteen: 0.1,
            mem_used: 1024,
            mem_total: 4096,
        };
        repo.record(&sample).await.unwrap();
        repo.record(&sample).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 2);
        let all = repo.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].mem_total, 4096);
        assert_eq!(all[0].load_one, 0.5);
    }
}
