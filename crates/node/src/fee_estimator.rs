//! Confirmation-time fee estimator and its `fee_estimates.dat` snapshot.

use std::fs;
use std::path::Path;

use dualchain_primitives::encoding::{Decoder, Encoder};

const FEE_ESTIMATES_FILE_VERSION: u32 = 1;

const MAX_BLOCK_CONFIRMS: u32 = 25;
const DEFAULT_DECAY: f64 = 0.998;
const MIN_SUCCESS_PCT: f64 = 0.85;
const SUFFICIENT_FEETXS: f64 = 1.0;

const MAX_FEERATE_PER_KB: f64 = 1e7;
const FEE_SPACING: f64 = 1.1;

/// One transaction confirmed by a connected block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConfirmedTx {
    pub fee: i64,
    pub size: usize,
    /// Height at which the transaction entered the pool.
    pub entry_height: u32,
}

#[derive(Clone, Debug)]
struct TxConfirmStats {
    buckets: Vec<f64>,
    tx_ct_avg: Vec<f64>,
    cur_block_tx_ct: Vec<u32>,
    conf_avg: Vec<Vec<f64>>,
    cur_block_conf: Vec<Vec<u32>>,
    avg: Vec<f64>,
    cur_block_val: Vec<f64>,
    decay: f64,
}

impl TxConfirmStats {
    fn initialize(default_buckets: &[f64], max_confirms: u32, decay: f64) -> Self {
        let mut buckets = Vec::with_capacity(default_buckets.len() + 1);
        buckets.extend_from_slice(default_buckets);
        buckets.push(f64::INFINITY);

        let bucket_count = buckets.len();
        let max_confirms = usize::try_from(max_confirms.max(1)).unwrap_or(1);

        Self {
            buckets,
            tx_ct_avg: vec![0.0; bucket_count],
            cur_block_tx_ct: vec![0; bucket_count],
            conf_avg: vec![vec![0.0; bucket_count]; max_confirms],
            cur_block_conf: vec![vec![0; bucket_count]; max_confirms],
            avg: vec![0.0; bucket_count],
            cur_block_val: vec![0.0; bucket_count],
            decay,
        }
    }

    fn max_confirms(&self) -> u32 {
        u32::try_from(self.conf_avg.len()).unwrap_or(u32::MAX)
    }

    fn find_bucket_index(&self, val: f64) -> usize {
        if !val.is_finite() {
            return self.buckets.len().saturating_sub(1);
        }
        match self.buckets.binary_search_by(|probe| probe.total_cmp(&val)) {
            Ok(idx) => idx,
            Err(idx) => idx.min(self.buckets.len().saturating_sub(1)),
        }
    }

    fn clear_current(&mut self) {
        for bucket in 0..self.buckets.len() {
            for conf in &mut self.cur_block_conf {
                conf[bucket] = 0;
            }
            self.cur_block_tx_ct[bucket] = 0;
            self.cur_block_val[bucket] = 0.0;
        }
    }

    /// A transaction confirmed within `blocks_to_confirm` also counts for every larger target.
    fn record(&mut self, blocks_to_confirm: u32, val: f64) {
        if blocks_to_confirm < 1 {
            return;
        }
        let bucket_index = self.find_bucket_index(val);
        let first = usize::try_from(blocks_to_confirm).unwrap_or(usize::MAX);
        for row in self.cur_block_conf.iter_mut().skip(first - 1) {
            row[bucket_index] = row[bucket_index].saturating_add(1);
        }
        self.cur_block_tx_ct[bucket_index] = self.cur_block_tx_ct[bucket_index].saturating_add(1);
        self.cur_block_val[bucket_index] += val;
    }

    fn update_moving_averages(&mut self) {
        for bucket in 0..self.buckets.len() {
            for conf in 0..self.conf_avg.len() {
                self.conf_avg[conf][bucket] = self.conf_avg[conf][bucket] * self.decay
                    + f64::from(self.cur_block_conf[conf][bucket]);
            }
            self.avg[bucket] = self.avg[bucket] * self.decay + self.cur_block_val[bucket];
            self.tx_ct_avg[bucket] =
                self.tx_ct_avg[bucket] * self.decay + f64::from(self.cur_block_tx_ct[bucket]);
        }
    }

    /// Walks from the most expensive bucket down, grouping buckets until each group has
    /// enough data, and stops at the first group that confirms too rarely. Returns the
    /// median fee rate of the last passing group.
    fn estimate_median_val(
        &self,
        conf_target: u32,
        sufficient_tx_val: f64,
        success_break_point: f64,
    ) -> Option<f64> {
        let conf_target = usize::try_from(conf_target).ok()?;
        if conf_target == 0 || conf_target > self.conf_avg.len() || self.buckets.is_empty() {
            return None;
        }

        let mut n_conf = 0.0;
        let mut total_num = 0.0;
        let mut cur_near_bucket = self.buckets.len() - 1;
        let mut best_near_bucket = cur_near_bucket;
        let mut best_far_bucket = cur_near_bucket;
        let mut found_answer = false;

        for bucket in (0..self.buckets.len()).rev() {
            n_conf += self.conf_avg[conf_target - 1][bucket];
            total_num += self.tx_ct_avg[bucket];

            if total_num >= sufficient_tx_val / (1.0 - self.decay) {
                if n_conf / total_num < success_break_point {
                    break;
                }
                found_answer = true;
                n_conf = 0.0;
                total_num = 0.0;
                best_near_bucket = cur_near_bucket;
                best_far_bucket = bucket;
                cur_near_bucket = bucket.saturating_sub(1);
            }
        }

        let min_bucket = best_near_bucket.min(best_far_bucket);
        let max_bucket = best_near_bucket.max(best_far_bucket);
        let mut tx_sum: f64 = self.tx_ct_avg[min_bucket..=max_bucket].iter().sum();
        if !found_answer || tx_sum == 0.0 {
            return None;
        }

        tx_sum /= 2.0;
        for idx in min_bucket..=max_bucket {
            if self.tx_ct_avg[idx] < tx_sum {
                tx_sum -= self.tx_ct_avg[idx];
            } else {
                return Some(self.avg[idx] / self.tx_ct_avg[idx]);
            }
        }
        None
    }

    fn encode(&self, encoder: &mut Encoder) {
        write_f64(encoder, self.decay);
        write_vec_f64(encoder, &self.buckets);
        write_vec_f64(encoder, &self.avg);
        write_vec_f64(encoder, &self.tx_ct_avg);
        encoder.write_varint(self.conf_avg.len() as u64);
        for row in &self.conf_avg {
            write_vec_f64(encoder, row);
        }
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, String> {
        let decay = read_f64(decoder)?;
        if !(0.0..1.0).contains(&decay) {
            return Err("corrupt fee estimates file: decay must be between 0 and 1".to_string());
        }

        let buckets = read_vec_f64(decoder)?;
        let num_buckets = buckets.len();
        if num_buckets <= 1 || num_buckets > 1000 {
            return Err("corrupt fee estimates file: invalid bucket count".to_string());
        }
        let avg = read_vec_f64(decoder)?;
        let tx_ct_avg = read_vec_f64(decoder)?;
        if avg.len() != num_buckets || tx_ct_avg.len() != num_buckets {
            return Err("corrupt fee estimates file: mismatch in bucket count".to_string());
        }
        let rows = read_len(decoder)?;
        if rows != usize::try_from(MAX_BLOCK_CONFIRMS).unwrap_or(25) {
            return Err("corrupt fee estimates file: unsupported max confirms".to_string());
        }
        let mut conf_avg = Vec::with_capacity(rows);
        for _ in 0..rows {
            let row = read_vec_f64(decoder)?;
            if row.len() != num_buckets {
                return Err(
                    "corrupt fee estimates file: mismatch in conf average bucket count".to_string(),
                );
            }
            conf_avg.push(row);
        }

        Ok(Self {
            buckets,
            tx_ct_avg,
            cur_block_tx_ct: vec![0; num_buckets],
            cur_block_conf: vec![vec![0; num_buckets]; rows],
            conf_avg,
            avg,
            cur_block_val: vec![0.0; num_buckets],
            decay,
        })
    }
}

pub struct FeeEstimator {
    min_tracked_fee_per_kb: i64,
    best_seen_height: u32,
    fee_stats: TxConfirmStats,
    revision: u64,
}

impl FeeEstimator {
    pub fn new(min_relay_fee_per_kb: i64) -> Self {
        let min_tracked_fee_per_kb = min_relay_fee_per_kb.max(1);
        let mut buckets = Vec::new();
        let mut boundary = min_tracked_fee_per_kb as f64;
        while boundary <= MAX_FEERATE_PER_KB {
            buckets.push(boundary);
            boundary *= FEE_SPACING;
        }
        Self {
            min_tracked_fee_per_kb,
            best_seen_height: 0,
            fee_stats: TxConfirmStats::initialize(&buckets, MAX_BLOCK_CONFIRMS, DEFAULT_DECAY),
            revision: 0,
        }
    }

    /// A missing file yields a fresh estimator.
    pub fn load(path: &Path, min_relay_fee_per_kb: i64) -> Result<Self, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(min_relay_fee_per_kb))
            }
            Err(err) => return Err(err.to_string()),
        };

        let mut decoder = Decoder::new(&bytes);
        let version = decoder
            .read_u32_le()
            .map_err(|err| format!("invalid fee estimates file: {err}"))?;
        if version != FEE_ESTIMATES_FILE_VERSION {
            return Err(format!(
                "unsupported fee estimates file version {version} (expected {FEE_ESTIMATES_FILE_VERSION})"
            ));
        }
        let best_seen_height = decoder
            .read_u32_le()
            .map_err(|err| format!("invalid fee estimates file: {err}"))?;
        let fee_stats = TxConfirmStats::decode(&mut decoder)?;
        if !decoder.is_empty() {
            return Err("invalid fee estimates file: trailing bytes".to_string());
        }

        Ok(Self {
            min_tracked_fee_per_kb: min_relay_fee_per_kb.max(1),
            best_seen_height,
            fee_stats,
            revision: 0,
        })
    }

    pub fn save(&self, path: &Path) -> Result<usize, String> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(FEE_ESTIMATES_FILE_VERSION);
        encoder.write_u32_le(self.best_seen_height);
        self.fee_stats.encode(&mut encoder);
        let bytes = encoder.into_inner();
        let len = bytes.len();
        crate::write_file_atomic(path, &bytes)?;
        Ok(len)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn best_seen_height(&self) -> u32 {
        self.best_seen_height
    }

    /// Blocks at or below the best seen height are ignored.
    pub fn process_block(&mut self, block_height: u32, entries: &[ConfirmedTx]) {
        if block_height <= self.best_seen_height {
            return;
        }
        self.best_seen_height = block_height;

        self.fee_stats.clear_current();
        for entry in entries {
            let Some(blocks_to_confirm) = block_height.checked_sub(entry.entry_height) else {
                continue;
            };
            let fee_rate = fee_rate_per_kb(entry.fee, entry.size);
            if blocks_to_confirm == 0 || fee_rate < self.min_tracked_fee_per_kb {
                continue;
            }
            self.fee_stats.record(blocks_to_confirm, fee_rate as f64);
        }
        self.fee_stats.update_moving_averages();
        self.revision = self.revision.saturating_add(1);
    }

    pub fn estimate_fee_per_kb(&self, target_blocks: u32) -> Option<i64> {
        if target_blocks < 1 || target_blocks > self.fee_stats.max_confirms() {
            return None;
        }
        let median =
            self.fee_stats
                .estimate_median_val(target_blocks, SUFFICIENT_FEETXS, MIN_SUCCESS_PCT)?;
        if median <= 0.0 || !median.is_finite() {
            return None;
        }
        Some(median.min(i64::MAX as f64) as i64)
    }
}

fn fee_rate_per_kb(fee: i64, size: usize) -> i64 {
    if fee <= 0 {
        return 0;
    }
    let size = i64::try_from(size.max(1)).unwrap_or(i64::MAX);
    fee.saturating_mul(1000).saturating_div(size)
}

fn write_f64(encoder: &mut Encoder, value: f64) {
    encoder.write_u64_le(value.to_bits());
}

fn read_f64(decoder: &mut Decoder<'_>) -> Result<f64, String> {
    let raw = decoder
        .read_u64_le()
        .map_err(|err| format!("invalid fee estimates file: {err}"))?;
    Ok(f64::from_bits(raw))
}

fn write_vec_f64(encoder: &mut Encoder, values: &[f64]) {
    encoder.write_varint(values.len() as u64);
    for value in values {
        write_f64(encoder, *value);
    }
}

fn read_len(decoder: &mut Decoder<'_>) -> Result<usize, String> {
    let len = decoder
        .read_varint()
        .map_err(|err| format!("invalid fee estimates file: {err}"))?;
    usize::try_from(len).map_err(|_| "invalid fee estimates file: length too large".to_string())
}

fn read_vec_f64(decoder: &mut Decoder<'_>) -> Result<Vec<f64>, String> {
    let len = read_len(decoder)?;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(read_f64(decoder)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_blocks(estimator: &mut FeeEstimator, blocks: u32, fee: i64, confirm_after: u32) {
        let start = estimator.best_seen_height() + 1;
        for height in start..start + blocks {
            let entries: Vec<ConfirmedTx> = (0..4)
                .map(|_| ConfirmedTx {
                    fee,
                    size: 250,
                    entry_height: height - confirm_after,
                })
                .collect();
            estimator.process_block(height, &entries);
        }
    }

    #[test]
    fn estimate_tracks_confirmed_fee_rates() {
        let mut estimator = FeeEstimator::new(1000);
        assert_eq!(estimator.estimate_fee_per_kb(2), None);
        fill_blocks(&mut estimator, 200, 2_500, 1);
        let estimate = estimator.estimate_fee_per_kb(2).expect("estimate");
        assert!((9_000..=11_000).contains(&estimate), "estimate {estimate}");
        assert_eq!(estimator.estimate_fee_per_kb(0), None);
        assert_eq!(estimator.estimate_fee_per_kb(MAX_BLOCK_CONFIRMS + 1), None);
    }

    #[test]
    fn stale_blocks_are_ignored() {
        let mut estimator = FeeEstimator::new(1000);
        estimator.process_block(10, &[]);
        let revision = estimator.revision();
        estimator.process_block(10, &[]);
        estimator.process_block(9, &[]);
        assert_eq!(estimator.revision(), revision);
        assert_eq!(estimator.best_seen_height(), 10);
    }

    #[test]
    fn snapshot_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fee_estimates.dat");
        let mut estimator = FeeEstimator::new(1000);
        fill_blocks(&mut estimator, 200, 2_500, 1);
        estimator.save(&path).expect("save");

        let reloaded = FeeEstimator::load(&path, 1000).expect("load");
        assert_eq!(reloaded.best_seen_height(), estimator.best_seen_height());
        assert_eq!(
            reloaded.estimate_fee_per_kb(2),
            estimator.estimate_fee_per_kb(2)
        );
    }

    #[test]
    fn missing_file_is_fresh_and_garbage_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fee_estimates.dat");
        assert_eq!(
            FeeEstimator::load(&path, 1000).expect("fresh").best_seen_height(),
            0
        );
        fs::write(&path, [1, 0, 0, 0, 5]).expect("write");
        assert!(FeeEstimator::load(&path, 1000).is_err());
    }
}
