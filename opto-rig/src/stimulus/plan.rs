use std::collections::BTreeMap;

use rand::Rng;

use crate::ConfigurationError;

/// A pattern shown on the projector, identified by `id`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Mask {
    pub id: u32,
    pub name: String,
}

impl Mask {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

/// The ordered masks of one stimulation run, one per trial.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StimulusPlan {
    trials: Vec<Mask>,
}

impl StimulusPlan {
    /// The masks in the given order, the whole list repeated `reps` times.
    pub fn sequential(masks: &[Mask], reps: usize) -> Result<Self, ConfigurationError> {
        let trials: Vec<Mask> = (0..reps).flat_map(|_| masks.iter().cloned()).collect();
        if trials.is_empty() {
            return Err(ConfigurationError::EmptyPlan);
        }
        Ok(Self { trials })
    }

    /// Each mask `reps` times in random order with no mask directly followed
    /// by itself.
    ///
    /// Built one trial at a time: each step picks, weighted by how often it
    /// remains, among the masks after which the remainder can still be
    /// arranged. This never needs to retry.
    pub fn shuffled<R: Rng + ?Sized>(
        masks: &[Mask],
        reps: usize,
        rng: &mut R,
    ) -> Result<Self, ConfigurationError> {
        let mut remaining: BTreeMap<u32, (Mask, usize)> = BTreeMap::new();
        for mask in masks {
            remaining.entry(mask.id).or_insert_with(|| (mask.clone(), 0)).1 += reps;
        }
        let total: usize = remaining.values().map(|(_, n)| n).sum();
        if total == 0 {
            return Err(ConfigurationError::EmptyPlan);
        }
        if remaining.len() == 1 {
            return Err(ConfigurationError::SingleDistinctMask);
        }
        if let Some((id, count)) = remaining
            .iter()
            .map(|(id, (_, n))| (*id, *n))
            .find(|(_, n)| 2 * n > total + 1)
        {
            return Err(ConfigurationError::UnsatisfiableOrder { id, count, total });
        }

        let mut trials = Vec::with_capacity(total);
        let mut prev: Option<u32> = None;
        for left in (1..=total).rev() {
            let candidates: Vec<(u32, usize)> = remaining
                .iter()
                .filter(|(id, (_, n))| *n > 0 && Some(**id) != prev)
                .filter(|(id, _)| can_follow(&remaining, **id, left - 1))
                .map(|(id, (_, n))| (*id, *n))
                .collect();
            let weight_sum: usize = candidates.iter().map(|(_, n)| n).sum();
            if weight_sum == 0 {
                // Excluded by the check above.
                return Err(ConfigurationError::UnsatisfiableOrder {
                    id: prev.unwrap_or_default(),
                    count: left,
                    total,
                });
            }
            let mut pick = rng.random_range(0..weight_sum);
            let mut chosen = candidates[0].0;
            for (id, n) in candidates {
                if pick < n {
                    chosen = id;
                    break;
                }
                pick -= n;
            }
            if let Some((mask, n)) = remaining.get_mut(&chosen) {
                *n -= 1;
                trials.push(mask.clone());
            }
            prev = Some(chosen);
        }
        Ok(Self { trials })
    }

    /// An explicit order, used as given.
    pub fn from_trials(trials: Vec<Mask>) -> Result<Self, ConfigurationError> {
        if trials.is_empty() {
            return Err(ConfigurationError::EmptyPlan);
        }
        Ok(Self { trials })
    }

    pub fn trials(&self) -> &[Mask] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn mask_ids(&self) -> Vec<u32> {
        self.trials.iter().map(|m| m.id).collect()
    }

    pub fn mask_names(&self) -> Vec<String> {
        self.trials.iter().map(|m| m.name.clone()).collect()
    }
}

/// Whether the `left` trials remaining after taking one `id` can be
/// arranged without adjacent repeats, given that `id` comes directly before
/// them.
fn can_follow(remaining: &BTreeMap<u32, (Mask, usize)>, id: u32, left: usize) -> bool {
    remaining.iter().all(|(other, (_, n))| {
        let n = if *other == id { n - 1 } else { *n };
        if *other == id {
            2 * n <= left
        } else {
            2 * n <= left + 1
        }
    })
}
