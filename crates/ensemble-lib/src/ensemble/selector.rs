//! n-best candidate selection

use crate::models::ModelId;
use crate::store::PredictionRecord;
use tracing::debug;

/// Candidates scoring at or below this are treated as no better than random
pub const RANDOM_SCORE_THRESHOLD: f64 = 0.001;

/// Rank candidates by ensemble score and keep the best `n`
///
/// Ties keep insertion order. Baselines and candidates at or below
/// [`RANDOM_SCORE_THRESHOLD`] are dropped unless that leaves nothing, in which case the
/// builder's own baseline (the scored baseline trained with `seed`) is returned alone.
/// Every record that is not selected has its arrays evicted; scores are kept.
pub fn select_n_best<'a, I>(records: I, n: usize, seed: u64) -> Vec<ModelId>
where
    I: IntoIterator<Item = &'a mut PredictionRecord>,
{
    let mut ranked: Vec<&mut PredictionRecord> = records.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.ensemble_score
            .total_cmp(&a.ensemble_score)
            .then_with(|| a.sequence().cmp(&b.sequence()))
    });

    let mut selected: Vec<ModelId> = ranked
        .iter()
        .filter(|r| r.is_scored() && !r.is_baseline && r.ensemble_score > RANDOM_SCORE_THRESHOLD)
        .map(|r| r.id)
        .collect();

    if selected.is_empty() {
        // Baselines of other builders in a shared pool are not ours to publish
        if let Some(baseline) = ranked
            .iter()
            .find(|r| r.is_scored() && r.is_baseline && r.id.seed == seed)
        {
            debug!(
                candidates = ranked.len(),
                baseline = %baseline.id,
                "No candidate beats random, falling back to the baseline"
            );
            selected.push(baseline.id);
        }
    }
    selected.truncate(n);

    for record in ranked.iter_mut() {
        if !selected.contains(&record.id) {
            record.evict_arrays();
        }
    }

    selected
}

/// Restrict the selection to candidates with companion predictions
///
/// Prefers candidates holding a test prediction, then a valid prediction, and falls back
/// to the whole selection. Selection order is preserved.
pub fn narrow_to_companions(
    selected: &[ModelId],
    valid: &[ModelId],
    test: &[ModelId],
) -> Vec<ModelId> {
    let keep = |available: &[ModelId]| -> Vec<ModelId> {
        selected
            .iter()
            .filter(|id| available.contains(id))
            .copied()
            .collect()
    };

    let with_test = keep(test);
    if !with_test.is_empty() {
        return with_test;
    }
    let with_valid = keep(valid);
    if !with_valid.is_empty() {
        return with_valid;
    }
    selected.to_vec()
}
