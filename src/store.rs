//! Accounting store: one file-backed SQLite database holding request
//! records, runtime intervals, and pricing configuration per model.
//!
//! Arbitrary model names never appear in SQL identifiers: each model is
//! mapped to a stable filesystem-safe token (`model_` + first 16 hex chars
//! of its SHA-256) recorded in `model_name_map`, and every per-model table
//! is namespaced by that token.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::GatewayError;

/// One completed proxied request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestRecord {
    pub ts: f64,
    pub in_tok: i64,
    pub out_tok: i64,
    pub cache_n: i64,
    pub prompt_n: i64,
}

/// One backend (or program) uptime interval. An open interval has
/// `end_ts == start_ts` at creation and is advanced while live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeInterval {
    pub start_ts: f64,
    pub end_ts: f64,
}

/// One pricing tier. Bounds follow `min < value <= max`; `-1` = unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub tier_index: i64,
    pub min_input_tokens: i64,
    pub max_input_tokens: i64,
    pub min_output_tokens: i64,
    pub max_output_tokens: i64,
    pub input_price: f64,
    pub output_price: f64,
    pub support_cache: bool,
    #[serde(default)]
    pub cache_write_price: f64,
    #[serde(default)]
    pub cache_read_price: f64,
}

/// Billing configuration for one model.
#[derive(Debug, Clone, Serialize)]
pub struct BillingConfig {
    pub use_tiered: bool,
    pub hourly_price: f64,
    pub tiers: Vec<Tier>,
}

#[derive(Debug, Serialize)]
pub struct ModelStorageStats {
    pub request_count: i64,
    pub runtime_count: i64,
    pub tier_count: i64,
}

#[derive(Debug, Serialize)]
pub struct StorageStats {
    pub database_exists: bool,
    pub database_size_mb: f64,
    pub total_models_with_data: usize,
    pub total_requests: i64,
    pub models_data: BTreeMap<String, ModelStorageStats>,
}

/// The durable accounting store.
pub struct AccountingStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

/// Filesystem-safe table namespace for a model name.
pub fn safe_name(model: &str) -> String {
    let digest = Sha256::digest(model.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("model_{}", &hex[..16])
}

impl AccountingStore {
    /// Open (creating if needed) the database and ensure tables exist for
    /// every catalogued model.
    pub async fn open(db_path: &Path, catalogue: &[String]) -> Result<Self, GatewayError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| GatewayError::Internal(format!("create db dir: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            db_path: db_path.to_path_buf(),
        };
        store.initialize(catalogue).await?;
        info!(db = %db_path.display(), models = catalogue.len(), "Accounting store ready");
        Ok(store)
    }

    async fn initialize(&self, catalogue: &[String]) -> Result<(), GatewayError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS model_name_map (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original TEXT UNIQUE NOT NULL,
                safe TEXT UNIQUE NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS program_runtime (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for model in catalogue {
            self.ensure_model(model).await?;
        }
        Ok(())
    }

    /// Create the mapping row and per-model tables, seeding pricing
    /// defaults, if they do not already exist.
    pub async fn ensure_model(&self, model: &str) -> Result<(), GatewayError> {
        let safe = safe_name(model);

        sqlx::query("INSERT OR IGNORE INTO model_name_map (original, safe) VALUES (?, ?)")
            .bind(model)
            .bind(&safe)
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {safe}_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL NOT NULL,
                in_tok INTEGER NOT NULL,
                out_tok INTEGER NOT NULL,
                cache_n INTEGER NOT NULL,
                prompt_n INTEGER NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {safe}_runtime (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {safe}_tier_pricing (
                tier_idx INTEGER PRIMARY KEY,
                in_min INTEGER NOT NULL,
                in_max INTEGER NOT NULL,
                out_min INTEGER NOT NULL,
                out_max INTEGER NOT NULL,
                in_price REAL NOT NULL,
                out_price REAL NOT NULL,
                cache_ok BOOLEAN NOT NULL DEFAULT 0,
                cache_write_price REAL NOT NULL DEFAULT 0.0,
                cache_read_price REAL NOT NULL DEFAULT 0.0
            )"
        ))
        .execute(&self.pool)
        .await?;

        let tier_count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {safe}_tier_pricing"))
                .fetch_one(&self.pool)
                .await?;
        if tier_count == 0 {
            sqlx::query(&format!(
                "INSERT INTO {safe}_tier_pricing
                 (tier_idx, in_min, in_max, out_min, out_max, in_price, out_price,
                  cache_ok, cache_write_price, cache_read_price)
                 VALUES (1, 0, 32768, 0, -1, 0, 0, 0, 0, 0)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {safe}_hourly_price (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                price REAL NOT NULL DEFAULT 0
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {safe}_hourly_price (id, price) VALUES (1, 0)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {safe}_billing_mode (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                use_tiered BOOLEAN NOT NULL DEFAULT 1
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {safe}_billing_mode (id, use_tiered) VALUES (1, 1)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn safe_for(&self, model: &str) -> Result<String, GatewayError> {
        let row = sqlx::query("SELECT safe FROM model_name_map WHERE original = ?")
            .bind(model)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.get::<String, _>("safe"))
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))
    }

    // -- request records -----------------------------------------------------

    pub async fn add_request(&self, model: &str, rec: RequestRecord) -> Result<(), GatewayError> {
        let safe = self.safe_for(model).await?;
        sqlx::query(&format!(
            "INSERT INTO {safe}_requests (ts, in_tok, out_tok, cache_n, prompt_n)
             VALUES (?, ?, ?, ?, ?)"
        ))
        .bind(rec.ts)
        .bind(rec.in_tok)
        .bind(rec.out_tok)
        .bind(rec.cache_n)
        .bind(rec.prompt_n)
        .execute(&self.pool)
        .await?;
        debug!(model = %model, in_tok = rec.in_tok, out_tok = rec.out_tok, "request recorded");
        Ok(())
    }

    /// Records with `t0 <= ts <= t1`, ascending by timestamp.
    pub async fn requests_in(
        &self,
        model: &str,
        t0: f64,
        t1: f64,
    ) -> Result<Vec<RequestRecord>, GatewayError> {
        let safe = self.safe_for(model).await?;
        let rows = sqlx::query(&format!(
            "SELECT ts, in_tok, out_tok, cache_n, prompt_n FROM {safe}_requests
             WHERE ts >= ? AND ts <= ? ORDER BY ts ASC"
        ))
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RequestRecord {
                ts: r.get("ts"),
                in_tok: r.get("in_tok"),
                out_tok: r.get("out_tok"),
                cache_n: r.get("cache_n"),
                prompt_n: r.get("prompt_n"),
            })
            .collect())
    }

    pub async fn request_count(&self, model: &str) -> Result<i64, GatewayError> {
        let safe = self.safe_for(model).await?;
        Ok(
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {safe}_requests"))
                .fetch_one(&self.pool)
                .await?,
        )
    }

    // -- runtime intervals ---------------------------------------------------

    pub async fn runtime_open(&self, model: &str, ts: f64) -> Result<(), GatewayError> {
        let safe = self.safe_for(model).await?;
        sqlx::query(&format!(
            "INSERT INTO {safe}_runtime (start_time, end_time) VALUES (?, ?)"
        ))
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance (or finalise) the most recent interval's end.
    pub async fn runtime_touch(&self, model: &str, ts: f64) -> Result<(), GatewayError> {
        let safe = self.safe_for(model).await?;
        sqlx::query(&format!(
            "UPDATE {safe}_runtime SET end_time = ?
             WHERE id = (SELECT MAX(id) FROM {safe}_runtime)"
        ))
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Intervals overlapping `[t0, t1]`.
    pub async fn runtime_overlapping(
        &self,
        model: &str,
        t0: f64,
        t1: f64,
    ) -> Result<Vec<RuntimeInterval>, GatewayError> {
        let safe = self.safe_for(model).await?;
        let rows = sqlx::query(&format!(
            "SELECT start_time, end_time FROM {safe}_runtime
             WHERE end_time >= ? AND start_time <= ? ORDER BY id ASC"
        ))
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RuntimeInterval {
                start_ts: r.get("start_time"),
                end_ts: r.get("end_time"),
            })
            .collect())
    }

    pub async fn program_runtime_open(&self, ts: f64) -> Result<(), GatewayError> {
        sqlx::query("INSERT INTO program_runtime (start_time, end_time) VALUES (?, ?)")
            .bind(ts)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn program_runtime_touch(&self, ts: f64) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE program_runtime SET end_time = ?
             WHERE id = (SELECT MAX(id) FROM program_runtime)",
        )
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Start of the most recent program runtime interval.
    pub async fn latest_program_start(&self) -> Result<Option<f64>, GatewayError> {
        let row = sqlx::query(
            "SELECT start_time FROM program_runtime ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("start_time")))
    }

    // -- pricing -------------------------------------------------------------

    pub async fn billing(&self, model: &str) -> Result<BillingConfig, GatewayError> {
        let safe = self.safe_for(model).await?;

        let use_tiered: bool =
            sqlx::query_scalar(&format!("SELECT use_tiered FROM {safe}_billing_mode WHERE id = 1"))
                .fetch_one(&self.pool)
                .await?;
        let hourly_price: f64 =
            sqlx::query_scalar(&format!("SELECT price FROM {safe}_hourly_price WHERE id = 1"))
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT tier_idx, in_min, in_max, out_min, out_max, in_price, out_price,
                    cache_ok, cache_write_price, cache_read_price
             FROM {safe}_tier_pricing ORDER BY tier_idx ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let tiers = rows
            .into_iter()
            .map(|r| Tier {
                tier_index: r.get("tier_idx"),
                min_input_tokens: r.get("in_min"),
                max_input_tokens: r.get("in_max"),
                min_output_tokens: r.get("out_min"),
                max_output_tokens: r.get("out_max"),
                input_price: r.get("in_price"),
                output_price: r.get("out_price"),
                support_cache: r.get("cache_ok"),
                cache_write_price: r.get("cache_write_price"),
                cache_read_price: r.get("cache_read_price"),
            })
            .collect();

        Ok(BillingConfig {
            use_tiered,
            hourly_price,
            tiers,
        })
    }

    /// Insert or update a tier by its index.
    pub async fn upsert_tier(&self, model: &str, tier: &Tier) -> Result<(), GatewayError> {
        if tier.tier_index <= 0 {
            return Err(GatewayError::PricingInvalid(format!(
                "tier index must be positive, got {}",
                tier.tier_index
            )));
        }
        for (label, min, max) in [
            ("input", tier.min_input_tokens, tier.max_input_tokens),
            ("output", tier.min_output_tokens, tier.max_output_tokens),
        ] {
            if max != -1 && max < min {
                return Err(GatewayError::PricingInvalid(format!(
                    "{label} range is empty: min {min} > max {max}"
                )));
            }
        }

        let safe = self.safe_for(model).await?;
        sqlx::query(&format!(
            "INSERT INTO {safe}_tier_pricing
             (tier_idx, in_min, in_max, out_min, out_max, in_price, out_price,
              cache_ok, cache_write_price, cache_read_price)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tier_idx) DO UPDATE SET
                in_min = excluded.in_min, in_max = excluded.in_max,
                out_min = excluded.out_min, out_max = excluded.out_max,
                in_price = excluded.in_price, out_price = excluded.out_price,
                cache_ok = excluded.cache_ok,
                cache_write_price = excluded.cache_write_price,
                cache_read_price = excluded.cache_read_price"
        ))
        .bind(tier.tier_index)
        .bind(tier.min_input_tokens)
        .bind(tier.max_input_tokens)
        .bind(tier.min_output_tokens)
        .bind(tier.max_output_tokens)
        .bind(tier.input_price)
        .bind(tier.output_price)
        .bind(tier.support_cache)
        .bind(tier.cache_write_price)
        .bind(tier.cache_read_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a tier; deleting the last remaining tier is rejected.
    pub async fn delete_tier(&self, model: &str, tier_index: i64) -> Result<(), GatewayError> {
        let safe = self.safe_for(model).await?;

        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {safe}_tier_pricing"))
                .fetch_one(&self.pool)
                .await?;
        if count <= 1 {
            return Err(GatewayError::LastTierDeletion(model.to_string()));
        }

        let result = sqlx::query(&format!(
            "DELETE FROM {safe}_tier_pricing WHERE tier_idx = ?"
        ))
        .bind(tier_index)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::PricingInvalid(format!(
                "tier {tier_index} does not exist for {model}"
            )));
        }
        Ok(())
    }

    pub async fn set_hourly_price(&self, model: &str, price: f64) -> Result<(), GatewayError> {
        if !price.is_finite() || price < 0.0 {
            return Err(GatewayError::PricingInvalid(format!(
                "hourly price must be a non-negative number, got {price}"
            )));
        }
        let safe = self.safe_for(model).await?;
        sqlx::query(&format!("UPDATE {safe}_hourly_price SET price = ? WHERE id = 1"))
            .bind(price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_billing_mode(&self, model: &str, use_tiered: bool) -> Result<(), GatewayError> {
        let safe = self.safe_for(model).await?;
        sqlx::query(&format!(
            "UPDATE {safe}_billing_mode SET use_tiered = ? WHERE id = 1"
        ))
        .bind(use_tiered)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- orphans and storage admin -------------------------------------------

    /// All model names present in the store.
    pub async fn all_db_models(&self) -> Result<Vec<String>, GatewayError> {
        let rows = sqlx::query("SELECT original FROM model_name_map ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("original")).collect())
    }

    /// Names present in the store but absent from the current catalogue.
    pub async fn list_orphans(
        &self,
        catalogue: &BTreeSet<String>,
    ) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .all_db_models()
            .await?
            .into_iter()
            .filter(|name| !catalogue.contains(name))
            .collect())
    }

    /// Drop all data for a model. Rejected while the model is catalogued.
    pub async fn drop_model(
        &self,
        model: &str,
        catalogue: &BTreeSet<String>,
    ) -> Result<(), GatewayError> {
        if catalogue.contains(model) {
            return Err(GatewayError::OrphanProtected(model.to_string()));
        }
        let safe = self.safe_for(model).await?;

        for suffix in ["requests", "runtime", "tier_pricing", "hourly_price", "billing_mode"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {safe}_{suffix}"))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("DELETE FROM model_name_map WHERE original = ?")
            .bind(model)
            .execute(&self.pool)
            .await?;

        info!(model = %model, "dropped accounting data");
        Ok(())
    }

    /// Database file size and per-model record counts.
    pub async fn storage_stats(&self) -> Result<StorageStats, GatewayError> {
        let size_bytes = tokio::fs::metadata(&self.db_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut models_data = BTreeMap::new();
        let mut total_requests = 0;
        let mut with_data = 0;

        for model in self.all_db_models().await? {
            let safe = self.safe_for(&model).await?;
            let request_count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {safe}_requests"))
                    .fetch_one(&self.pool)
                    .await?;
            let runtime_count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {safe}_runtime"))
                    .fetch_one(&self.pool)
                    .await?;
            let tier_count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {safe}_tier_pricing"))
                    .fetch_one(&self.pool)
                    .await?;

            total_requests += request_count;
            if request_count > 0 {
                with_data += 1;
            }
            models_data.insert(
                model,
                ModelStorageStats {
                    request_count,
                    runtime_count,
                    tier_count,
                },
            );
        }

        Ok(StorageStats {
            database_exists: size_bytes > 0,
            database_size_mb: (size_bytes as f64) / (1024.0 * 1024.0),
            total_models_with_data: with_data,
            total_requests,
            models_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store(models: &[&str]) -> (AccountingStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = models.iter().map(|s| s.to_string()).collect();
        let store = AccountingStore::open(&dir.path().join("monitoring.db"), &names)
            .await
            .unwrap();
        (store, dir)
    }

    #[test]
    fn safe_name_is_stable_and_identifier_safe() {
        let a = safe_name("my/weird model:v2");
        let b = safe_name("my/weird model:v2");
        assert_eq!(a, b);
        assert!(a.starts_with("model_"));
        assert_eq!(a.len(), "model_".len() + 16);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert_ne!(safe_name("a"), safe_name("b"));
    }

    #[tokio::test]
    async fn request_round_trip() {
        let (store, _dir) = test_store(&["m1"]).await;

        let rec = RequestRecord {
            ts: 1000.0,
            in_tok: 120,
            out_tok: 30,
            cache_n: 40,
            prompt_n: 80,
        };
        store.add_request("m1", rec).await.unwrap();
        store
            .add_request(
                "m1",
                RequestRecord {
                    ts: 2000.0,
                    in_tok: 1,
                    out_tok: 1,
                    cache_n: 0,
                    prompt_n: 1,
                },
            )
            .await
            .unwrap();

        let in_window = store.requests_in("m1", 500.0, 1500.0).await.unwrap();
        assert_eq!(in_window, vec![rec]);
        assert_eq!(store.request_count("m1").await.unwrap(), 2);

        assert!(matches!(
            store.add_request("ghost", rec).await,
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn runtime_interval_lifecycle() {
        let (store, _dir) = test_store(&["m1"]).await;

        store.runtime_open("m1", 100.0).await.unwrap();
        store.runtime_touch("m1", 160.0).await.unwrap();
        store.runtime_touch("m1", 220.0).await.unwrap();

        let overlapping = store.runtime_overlapping("m1", 150.0, 300.0).await.unwrap();
        assert_eq!(
            overlapping,
            vec![RuntimeInterval {
                start_ts: 100.0,
                end_ts: 220.0
            }]
        );

        // A second interval only touches the latest row.
        store.runtime_open("m1", 500.0).await.unwrap();
        store.runtime_touch("m1", 600.0).await.unwrap();
        let all = store.runtime_overlapping("m1", 0.0, 1000.0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].end_ts, 220.0);
        assert_eq!(all[1].end_ts, 600.0);

        let none = store.runtime_overlapping("m1", 230.0, 400.0).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn default_pricing_is_seeded() {
        let (store, _dir) = test_store(&["m1"]).await;

        let billing = store.billing("m1").await.unwrap();
        assert!(billing.use_tiered);
        assert_eq!(billing.hourly_price, 0.0);
        assert_eq!(billing.tiers.len(), 1);
        assert_eq!(billing.tiers[0].tier_index, 1);
        assert_eq!(billing.tiers[0].input_price, 0.0);
    }

    #[tokio::test]
    async fn tier_upsert_round_trip() {
        let (store, _dir) = test_store(&["m1"]).await;

        let tier = Tier {
            tier_index: 2,
            min_input_tokens: 1000,
            max_input_tokens: -1,
            min_output_tokens: 0,
            max_output_tokens: -1,
            input_price: 2.0,
            output_price: 4.0,
            support_cache: true,
            cache_write_price: 0.0,
            cache_read_price: 0.5,
        };
        store.upsert_tier("m1", &tier).await.unwrap();

        let billing = store.billing("m1").await.unwrap();
        assert_eq!(billing.tiers.len(), 2);
        assert_eq!(billing.tiers[1], tier);

        // Upsert by index overwrites in place.
        let updated = Tier {
            output_price: 8.0,
            ..tier.clone()
        };
        store.upsert_tier("m1", &updated).await.unwrap();
        let billing = store.billing("m1").await.unwrap();
        assert_eq!(billing.tiers.len(), 2);
        assert_eq!(billing.tiers[1].output_price, 8.0);
    }

    #[tokio::test]
    async fn tier_validation() {
        let (store, _dir) = test_store(&["m1"]).await;

        let mut bad = Tier {
            tier_index: 0,
            min_input_tokens: 0,
            max_input_tokens: -1,
            min_output_tokens: 0,
            max_output_tokens: -1,
            input_price: 1.0,
            output_price: 1.0,
            support_cache: false,
            cache_write_price: 0.0,
            cache_read_price: 0.0,
        };
        assert!(matches!(
            store.upsert_tier("m1", &bad).await,
            Err(GatewayError::PricingInvalid(_))
        ));

        bad.tier_index = 2;
        bad.min_input_tokens = 100;
        bad.max_input_tokens = 50;
        assert!(matches!(
            store.upsert_tier("m1", &bad).await,
            Err(GatewayError::PricingInvalid(_))
        ));
    }

    #[tokio::test]
    async fn last_tier_cannot_be_deleted() {
        let (store, _dir) = test_store(&["m1"]).await;

        let tier = Tier {
            tier_index: 2,
            min_input_tokens: 0,
            max_input_tokens: -1,
            min_output_tokens: 0,
            max_output_tokens: -1,
            input_price: 1.0,
            output_price: 1.0,
            support_cache: false,
            cache_write_price: 0.0,
            cache_read_price: 0.0,
        };
        store.upsert_tier("m1", &tier).await.unwrap();

        store.delete_tier("m1", 1).await.unwrap();
        assert!(matches!(
            store.delete_tier("m1", 2).await,
            Err(GatewayError::LastTierDeletion(_))
        ));

        let billing = store.billing("m1").await.unwrap();
        assert_eq!(billing.tiers.len(), 1);
        assert_eq!(billing.tiers[0].tier_index, 2);
    }

    #[tokio::test]
    async fn hourly_and_mode_round_trip() {
        let (store, _dir) = test_store(&["m1"]).await;

        store.set_hourly_price("m1", 3.5).await.unwrap();
        store.set_billing_mode("m1", false).await.unwrap();

        let billing = store.billing("m1").await.unwrap();
        assert!(!billing.use_tiered);
        assert_eq!(billing.hourly_price, 3.5);

        assert!(matches!(
            store.set_hourly_price("m1", -1.0).await,
            Err(GatewayError::PricingInvalid(_))
        ));
    }

    #[tokio::test]
    async fn orphan_listing_and_protected_drop() {
        let (store, _dir) = test_store(&["m1", "legacy"]).await;

        let catalogue: BTreeSet<String> = ["m1".to_string()].into_iter().collect();
        let orphans = store.list_orphans(&catalogue).await.unwrap();
        assert_eq!(orphans, vec!["legacy".to_string()]);

        assert!(matches!(
            store.drop_model("m1", &catalogue).await,
            Err(GatewayError::OrphanProtected(_))
        ));

        store.drop_model("legacy", &catalogue).await.unwrap();
        assert!(store.list_orphans(&catalogue).await.unwrap().is_empty());
        assert!(matches!(
            store.billing("legacy").await,
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn storage_stats_counts() {
        let (store, _dir) = test_store(&["m1", "m2"]).await;

        store
            .add_request(
                "m1",
                RequestRecord {
                    ts: 1.0,
                    in_tok: 10,
                    out_tok: 5,
                    cache_n: 0,
                    prompt_n: 10,
                },
            )
            .await
            .unwrap();

        let stats = store.storage_stats().await.unwrap();
        assert!(stats.database_exists);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_models_with_data, 1);
        assert_eq!(stats.models_data["m1"].request_count, 1);
        assert_eq!(stats.models_data["m2"].request_count, 0);
        assert_eq!(stats.models_data["m2"].tier_count, 1);
    }

    #[tokio::test]
    async fn program_runtime_round_trip() {
        let (store, _dir) = test_store(&[]).await;

        assert!(store.latest_program_start().await.unwrap().is_none());
        store.program_runtime_open(100.0).await.unwrap();
        store.program_runtime_touch(150.0).await.unwrap();
        store.program_runtime_open(900.0).await.unwrap();

        assert_eq!(store.latest_program_start().await.unwrap(), Some(900.0));
    }
}
