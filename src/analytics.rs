//! Time-bucketed aggregation and the pricing evaluator.
//!
//! Queries fetch each model's rows once and fold them into bucket-indexed
//! arrays; costs are assigned with one pass per tier over the whole row set
//! (lowest tier index wins), then pure array arithmetic. Nothing here
//! branches per record on pricing configuration, which keeps dashboard
//! queries fast over large request tables.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::Catalogue;
use crate::errors::GatewayError;
use crate::store::{AccountingStore, RequestRecord, RuntimeInterval, Tier};
use crate::unix_ts;

/// One point in a bucketed series; `timestamp` is the bucket midpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TimePoint<T> {
    pub timestamp: f64,
    pub data: T,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThroughputPoint {
    pub input_tokens_per_sec: f64,
    pub output_tokens_per_sec: f64,
    pub total_tokens_per_sec: f64,
    pub cache_hit_tokens_per_sec: f64,
    pub cache_miss_tokens_per_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenPoint {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_hit_tokens: i64,
    pub cache_miss_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostPoint {
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStatsPoint {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_hit_tokens: i64,
    pub cache_miss_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub total_tokens: i64,
    pub total_cost: f64,
}

#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub mode_summary: BTreeMap<String, UsageTotals>,
    pub overall_summary: UsageTotals,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse<T> {
    pub time_points: Vec<TimePoint<T>>,
    pub mode_breakdown: BTreeMap<String, Vec<TimePoint<T>>>,
}

#[derive(Debug, Default, Serialize)]
pub struct ModelStatsSummary {
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_tokens: i64,
    pub total_cache_n: i64,
    pub total_prompt_n: i64,
    pub total_cost: f64,
    pub request_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelStats {
    pub model_name: String,
    pub summary: ModelStatsSummary,
    pub time_points: Vec<TimePoint<ModelStatsPoint>>,
}

#[derive(Debug, Serialize)]
pub struct SessionTotals {
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_n: i64,
    pub total_prompt_n: i64,
    pub total_cost: f64,
    pub session_start_time: Option<f64>,
}

// ---------------------------------------------------------------------------
// Bucket and cost primitives
// ---------------------------------------------------------------------------

/// Clamped bucket index for a timestamp.
fn bucket_index(ts: f64, t0: f64, step: f64, n: usize) -> usize {
    let raw = ((ts - t0) / step).floor();
    (raw.max(0.0) as usize).min(n - 1)
}

/// Token sums per bucket, one array per class.
#[derive(Debug, Clone)]
pub struct TokenBuckets {
    pub input: Vec<i64>,
    pub output: Vec<i64>,
    pub total: Vec<i64>,
    pub cache_hit: Vec<i64>,
    pub cache_miss: Vec<i64>,
}

impl TokenBuckets {
    pub fn zeroed(n: usize) -> Self {
        Self {
            input: vec![0; n],
            output: vec![0; n],
            total: vec![0; n],
            cache_hit: vec![0; n],
            cache_miss: vec![0; n],
        }
    }

    pub fn accumulate(&mut self, records: &[RequestRecord], t0: f64, step: f64) {
        let n = self.input.len();
        for rec in records {
            let i = bucket_index(rec.ts, t0, step, n);
            self.input[i] += rec.in_tok;
            self.output[i] += rec.out_tok;
            self.total[i] += rec.in_tok + rec.out_tok;
            self.cache_hit[i] += rec.cache_n;
            self.cache_miss[i] += rec.prompt_n;
        }
    }
}

/// The tier matching a request: lowest index whose input and output bounds
/// both contain the value (`min < value <= max`, `-1` = unbounded).
pub fn match_tier<'a>(tiers: &'a [Tier], in_tok: i64, out_tok: i64) -> Option<&'a Tier> {
    tiers.iter().find(|tier| {
        let in_ok = in_tok > tier.min_input_tokens
            && (tier.max_input_tokens == -1 || in_tok <= tier.max_input_tokens);
        let out_ok = out_tok > tier.min_output_tokens
            && (tier.max_output_tokens == -1 || out_tok <= tier.max_output_tokens);
        in_ok && out_ok
    })
}

/// Tiered cost of one request under its matched tier. Unmatched requests
/// cost zero; this never raises.
///
/// Non-cache tiers price the full input; cache-aware tiers price only the
/// freshly-computed prompt tokens, then add cache reads and cache writes
/// (writes are charged per output token).
pub fn tiered_cost(rec: &RequestRecord, tiers: &[Tier]) -> f64 {
    let Some(tier) = match_tier(tiers, rec.in_tok, rec.out_tok) else {
        return 0.0;
    };
    if tier.support_cache {
        ((rec.prompt_n as f64) * tier.input_price
            + (rec.out_tok as f64) * tier.output_price
            + (rec.cache_n as f64) * tier.cache_read_price
            + (rec.out_tok as f64) * tier.cache_write_price)
            / 1e6
    } else {
        ((rec.in_tok as f64) * tier.input_price + (rec.out_tok as f64) * tier.output_price) / 1e6
    }
}

/// Per-request costs for a whole row set: one pass per tier assigns prices
/// to every still-unmatched row, then the cost formula runs over the
/// resulting arrays.
pub fn request_costs(records: &[RequestRecord], tiers: &[Tier]) -> Vec<f64> {
    let n = records.len();
    let mut in_price = vec![0.0f64; n];
    let mut out_price = vec![0.0f64; n];
    let mut cache_read = vec![0.0f64; n];
    let mut cache_write = vec![0.0f64; n];
    let mut cache_ok = vec![false; n];
    let mut matched = vec![false; n];

    // Tiers are ordered by index, so the first assignment wins.
    for tier in tiers {
        for (i, rec) in records.iter().enumerate() {
            if matched[i] {
                continue;
            }
            let in_ok = rec.in_tok > tier.min_input_tokens
                && (tier.max_input_tokens == -1 || rec.in_tok <= tier.max_input_tokens);
            let out_ok = rec.out_tok > tier.min_output_tokens
                && (tier.max_output_tokens == -1 || rec.out_tok <= tier.max_output_tokens);
            if in_ok && out_ok {
                matched[i] = true;
                in_price[i] = tier.input_price;
                out_price[i] = tier.output_price;
                if tier.support_cache {
                    cache_ok[i] = true;
                    cache_read[i] = tier.cache_read_price;
                    cache_write[i] = tier.cache_write_price;
                }
            }
        }
    }

    records
        .iter()
        .enumerate()
        .map(|(i, rec)| {
            if cache_ok[i] {
                ((rec.prompt_n as f64) * in_price[i]
                    + (rec.out_tok as f64) * out_price[i]
                    + (rec.cache_n as f64) * cache_read[i]
                    + (rec.out_tok as f64) * cache_write[i])
                    / 1e6
            } else {
                ((rec.in_tok as f64) * in_price[i] + (rec.out_tok as f64) * out_price[i]) / 1e6
            }
        })
        .collect()
}

/// Bucketed tiered costs.
pub fn cost_buckets_tiered(
    records: &[RequestRecord],
    tiers: &[Tier],
    t0: f64,
    step: f64,
    n: usize,
) -> Vec<f64> {
    let costs = request_costs(records, tiers);
    let mut buckets = vec![0.0; n];
    for (rec, cost) in records.iter().zip(costs) {
        buckets[bucket_index(rec.ts, t0, step, n)] += cost;
    }
    buckets
}

/// Overlap of two closed intervals, in seconds.
fn overlap_seconds(a0: f64, a1: f64, b0: f64, b1: f64) -> f64 {
    (a1.min(b1) - a0.max(b0)).max(0.0)
}

/// Bucketed hourly costs: each runtime interval contributes
/// `overlap_seconds / 3600 * hourly_price` to every bucket it crosses.
/// Open intervals are clamped to `now`.
pub fn cost_buckets_hourly(
    intervals: &[RuntimeInterval],
    hourly_price: f64,
    t0: f64,
    step: f64,
    n: usize,
    now: f64,
) -> Vec<f64> {
    let mut buckets = vec![0.0; n];
    if hourly_price <= 0.0 {
        return buckets;
    }
    let rate_per_sec = hourly_price / 3600.0;

    for interval in intervals {
        let start = interval.start_ts;
        let end = if interval.end_ts > interval.start_ts {
            interval.end_ts
        } else {
            now
        };
        for (i, bucket) in buckets.iter_mut().enumerate() {
            let b0 = t0 + (i as f64) * step;
            let b1 = b0 + step;
            *bucket += overlap_seconds(start, end, b0, b1) * rate_per_sec;
        }
    }
    buckets
}

fn midpoints(t0: f64, step: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| t0 + (i as f64 + 0.5) * step).collect()
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

// ---------------------------------------------------------------------------
// Query layer
// ---------------------------------------------------------------------------

/// Read-side API over the accounting store, organised per query the
/// dashboard makes.
pub struct Analytics {
    store: Arc<AccountingStore>,
    catalogue: Arc<Catalogue>,
}

impl Analytics {
    pub fn new(store: Arc<AccountingStore>, catalogue: Arc<Catalogue>) -> Self {
        Self { store, catalogue }
    }

    fn modes(&self) -> BTreeSet<String> {
        self.catalogue
            .names()
            .filter_map(|name| self.catalogue.mode_of(name))
            .map(String::from)
            .collect()
    }

    fn validate_window(t0: f64, t1: f64, n: usize) -> Result<f64, GatewayError> {
        if t0 >= t1 || n == 0 {
            return Err(GatewayError::InvalidRequest(
                "invalid time range or sample count".to_string(),
            ));
        }
        Ok((t1 - t0) / n as f64)
    }

    /// Per-model rows in the window, grouped with the model's mode.
    async fn rows_by_model(
        &self,
        t0: f64,
        t1: f64,
    ) -> Result<Vec<(String, String, Vec<RequestRecord>)>, GatewayError> {
        let mut out = Vec::new();
        for name in self.catalogue.names() {
            let mode = self.catalogue.mode_of(name).unwrap_or("Chat").to_string();
            let rows = self.store.requests_in(name, t0, t1).await?;
            out.push((name.to_string(), mode, rows));
        }
        Ok(out)
    }

    /// Throughput per second per token class: bucket token sums normalised
    /// by the bucket width.
    pub async fn throughput(
        &self,
        t0: f64,
        t1: f64,
        n: usize,
    ) -> Result<SeriesResponse<ThroughputPoint>, GatewayError> {
        let step = Self::validate_window(t0, t1, n)?;

        let mut overall = TokenBuckets::zeroed(n);
        let mut per_mode: BTreeMap<String, TokenBuckets> = self
            .modes()
            .into_iter()
            .map(|mode| (mode, TokenBuckets::zeroed(n)))
            .collect();

        for (_name, mode, rows) in self.rows_by_model(t0, t1).await? {
            overall.accumulate(&rows, t0, step);
            if let Some(buckets) = per_mode.get_mut(&mode) {
                buckets.accumulate(&rows, t0, step);
            }
        }

        let to_points = |buckets: &TokenBuckets| {
            midpoints(t0, step, n)
                .into_iter()
                .enumerate()
                .map(|(i, timestamp)| TimePoint {
                    timestamp,
                    data: ThroughputPoint {
                        input_tokens_per_sec: buckets.input[i] as f64 / step,
                        output_tokens_per_sec: buckets.output[i] as f64 / step,
                        total_tokens_per_sec: buckets.total[i] as f64 / step,
                        cache_hit_tokens_per_sec: buckets.cache_hit[i] as f64 / step,
                        cache_miss_tokens_per_sec: buckets.cache_miss[i] as f64 / step,
                    },
                })
                .collect::<Vec<_>>()
        };

        Ok(SeriesResponse {
            time_points: to_points(&overall),
            mode_breakdown: per_mode
                .iter()
                .map(|(mode, buckets)| (mode.clone(), to_points(buckets)))
                .collect(),
        })
    }

    /// Token totals per bucket (not per second).
    pub async fn token_trends(
        &self,
        t0: f64,
        t1: f64,
        n: usize,
    ) -> Result<SeriesResponse<TokenPoint>, GatewayError> {
        let step = Self::validate_window(t0, t1, n)?;

        let mut overall = TokenBuckets::zeroed(n);
        let mut per_mode: BTreeMap<String, TokenBuckets> = self
            .modes()
            .into_iter()
            .map(|mode| (mode, TokenBuckets::zeroed(n)))
            .collect();

        for (_name, mode, rows) in self.rows_by_model(t0, t1).await? {
            overall.accumulate(&rows, t0, step);
            if let Some(buckets) = per_mode.get_mut(&mode) {
                buckets.accumulate(&rows, t0, step);
            }
        }

        let to_points = |buckets: &TokenBuckets| {
            midpoints(t0, step, n)
                .into_iter()
                .enumerate()
                .map(|(i, timestamp)| TimePoint {
                    timestamp,
                    data: TokenPoint {
                        input_tokens: buckets.input[i],
                        output_tokens: buckets.output[i],
                        total_tokens: buckets.total[i],
                        cache_hit_tokens: buckets.cache_hit[i],
                        cache_miss_tokens: buckets.cache_miss[i],
                    },
                })
                .collect::<Vec<_>>()
        };

        Ok(SeriesResponse {
            time_points: to_points(&overall),
            mode_breakdown: per_mode
                .iter()
                .map(|(mode, buckets)| (mode.clone(), to_points(buckets)))
                .collect(),
        })
    }

    /// Cost per bucket, mixing tiered and hourly billing.
    pub async fn cost_trends(
        &self,
        t0: f64,
        t1: f64,
        n: usize,
    ) -> Result<SeriesResponse<CostPoint>, GatewayError> {
        let step = Self::validate_window(t0, t1, n)?;
        let now = unix_ts();

        let mut overall = vec![0.0; n];
        let mut per_mode: BTreeMap<String, Vec<f64>> = self
            .modes()
            .into_iter()
            .map(|mode| (mode, vec![0.0; n]))
            .collect();

        for name in self.catalogue.names() {
            let mode = self.catalogue.mode_of(name).unwrap_or("Chat").to_string();
            let billing = self.store.billing(name).await?;

            let buckets = if billing.use_tiered {
                let rows = self.store.requests_in(name, t0, t1).await?;
                cost_buckets_tiered(&rows, &billing.tiers, t0, step, n)
            } else {
                let intervals = self.store.runtime_overlapping(name, t0, t1).await?;
                cost_buckets_hourly(&intervals, billing.hourly_price, t0, step, n, now)
            };

            for i in 0..n {
                overall[i] += buckets[i];
                if let Some(mode_buckets) = per_mode.get_mut(&mode) {
                    mode_buckets[i] += buckets[i];
                }
            }
        }

        let to_points = |buckets: &[f64]| {
            midpoints(t0, step, n)
                .into_iter()
                .enumerate()
                .map(|(i, timestamp)| TimePoint {
                    timestamp,
                    data: CostPoint {
                        cost: round6(buckets[i]),
                    },
                })
                .collect::<Vec<_>>()
        };

        Ok(SeriesResponse {
            time_points: to_points(&overall),
            mode_breakdown: per_mode
                .iter()
                .map(|(mode, buckets)| (mode.clone(), to_points(buckets)))
                .collect(),
        })
    }

    /// Per-mode and overall token/cost totals over a window.
    pub async fn usage_summary(&self, t0: f64, t1: f64) -> Result<UsageSummary, GatewayError> {
        if t0 >= t1 {
            return Err(GatewayError::InvalidRequest("invalid time range".to_string()));
        }
        let now = unix_ts();

        let mut mode_summary: BTreeMap<String, UsageTotals> = self
            .modes()
            .into_iter()
            .map(|mode| (mode, UsageTotals::default()))
            .collect();
        let mut overall = UsageTotals::default();

        for name in self.catalogue.names() {
            let mode = self.catalogue.mode_of(name).unwrap_or("Chat").to_string();
            let billing = self.store.billing(name).await?;

            let (tokens, cost) = if billing.use_tiered {
                let rows = self.store.requests_in(name, t0, t1).await?;
                let tokens: i64 = rows.iter().map(|r| r.in_tok + r.out_tok).sum();
                let cost: f64 = request_costs(&rows, &billing.tiers).iter().sum();
                (tokens, cost)
            } else {
                let intervals = self.store.runtime_overlapping(name, t0, t1).await?;
                let cost: f64 =
                    cost_buckets_hourly(&intervals, billing.hourly_price, t0, t1 - t0, 1, now)
                        .into_iter()
                        .sum();
                (0, cost)
            };

            overall.total_tokens += tokens;
            overall.total_cost += cost;
            if let Some(entry) = mode_summary.get_mut(&mode) {
                entry.total_tokens += tokens;
                entry.total_cost += cost;
            }
        }

        overall.total_cost = round6(overall.total_cost);
        for entry in mode_summary.values_mut() {
            entry.total_cost = round6(entry.total_cost);
        }

        Ok(UsageSummary {
            mode_summary,
            overall_summary: overall,
        })
    }

    /// Per-model summary and series over a window.
    pub async fn model_stats(
        &self,
        canonical: &str,
        t0: f64,
        t1: f64,
        n: usize,
    ) -> Result<ModelStats, GatewayError> {
        let step = Self::validate_window(t0, t1, n)?;
        let now = unix_ts();
        let billing = self.store.billing(canonical).await?;

        let mut summary = ModelStatsSummary::default();
        let mut points: Vec<TimePoint<ModelStatsPoint>> = midpoints(t0, step, n)
            .into_iter()
            .map(|timestamp| TimePoint {
                timestamp,
                data: ModelStatsPoint::default(),
            })
            .collect();

        if billing.use_tiered {
            let rows = self.store.requests_in(canonical, t0, t1).await?;
            let costs = request_costs(&rows, &billing.tiers);

            for (rec, cost) in rows.iter().zip(&costs) {
                summary.total_input_tokens += rec.in_tok;
                summary.total_output_tokens += rec.out_tok;
                summary.total_tokens += rec.in_tok + rec.out_tok;
                summary.total_cache_n += rec.cache_n;
                summary.total_prompt_n += rec.prompt_n;
                summary.total_cost += cost;

                let point = &mut points[bucket_index(rec.ts, t0, step, n)].data;
                point.input_tokens += rec.in_tok;
                point.output_tokens += rec.out_tok;
                point.total_tokens += rec.in_tok + rec.out_tok;
                point.cache_hit_tokens += rec.cache_n;
                point.cache_miss_tokens += rec.prompt_n;
                point.cost += cost;
            }
            summary.request_count = rows.len();
        } else {
            let intervals = self.store.runtime_overlapping(canonical, t0, t1).await?;
            let buckets = cost_buckets_hourly(&intervals, billing.hourly_price, t0, step, n, now);
            summary.total_cost = buckets.iter().sum();
            for (point, cost) in points.iter_mut().zip(buckets) {
                point.data.cost = round6(cost);
            }
        }

        summary.total_cost = round6(summary.total_cost);
        for point in &mut points {
            point.data.cost = round6(point.data.cost);
        }

        Ok(ModelStats {
            model_name: canonical.to_string(),
            summary,
            time_points: points,
        })
    }

    /// Totals since the current program session started.
    pub async fn session_totals(&self) -> Result<SessionTotals, GatewayError> {
        let Some(session_start) = self.store.latest_program_start().await? else {
            return Ok(SessionTotals {
                total_input_tokens: 0,
                total_output_tokens: 0,
                total_cache_n: 0,
                total_prompt_n: 0,
                total_cost: 0.0,
                session_start_time: None,
            });
        };
        let now = unix_ts();

        let mut totals = SessionTotals {
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cache_n: 0,
            total_prompt_n: 0,
            total_cost: 0.0,
            session_start_time: Some(session_start),
        };

        for name in self.catalogue.names() {
            let billing = self.store.billing(name).await?;
            if billing.use_tiered {
                let rows = self.store.requests_in(name, session_start, now).await?;
                for rec in &rows {
                    totals.total_input_tokens += rec.in_tok;
                    totals.total_output_tokens += rec.out_tok;
                    totals.total_cache_n += rec.cache_n;
                    totals.total_prompt_n += rec.prompt_n;
                }
                totals.total_cost += request_costs(&rows, &billing.tiers).iter().sum::<f64>();
            } else {
                let intervals = self
                    .store
                    .runtime_overlapping(name, session_start, now)
                    .await?;
                totals.total_cost += cost_buckets_hourly(
                    &intervals,
                    billing.hourly_price,
                    session_start,
                    now - session_start,
                    1,
                    now,
                )
                .into_iter()
                .sum::<f64>();
            }
        }

        totals.total_cost = round6(totals.total_cost);
        Ok(totals)
    }
}
