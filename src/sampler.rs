//! Phase-aware negative item sampler.
//!
//! The sampler owns a shuffled pool of item ids, a cursor into it and, for
//! every declared phase, the cumulative set of items each user has already
//! interacted with. Negatives are read from the pool at the cursor and
//! redrawn while they collide with the user's seen set.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::config::SamplerConfig;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::{ItemId, UserId, PADDING_ITEM_ID};

/// How the negative pool is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Every item id exactly once.
    Uniform,
    /// One entry per observed interaction, so frequency follows popularity.
    Popularity,
}

impl FromStr for Distribution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "popularity" => Ok(Self::Popularity),
            _ => Err(Error::UnknownDistribution(s.to_string())),
        }
    }
}

pub struct Sampler {
    phases: Vec<String>,
    n_users: usize,
    n_items: usize,
    distribution: Distribution,
    pool: Vec<ItemId>,
    cursor: usize,
    /// phase -> user -> items seen in this phase and every earlier one
    used_item_ids: HashMap<String, Vec<HashSet<ItemId>>>,
}

impl Sampler {
    /// Build a sampler over `phases` paired one-to-one with `datasets`, in
    /// declaration order. User and item counts come from the first dataset.
    pub fn new(
        config: &SamplerConfig,
        phases: &[&str],
        datasets: &[&dyn Dataset],
        distribution: &str,
    ) -> Result<Self> {
        let distribution: Distribution = distribution.parse()?;
        if phases.len() != datasets.len() || phases.is_empty() {
            return Err(Error::PhaseDatasetMismatch {
                phases: phases.iter().map(|p| p.to_string()).collect(),
                datasets: datasets.len(),
            });
        }

        let n_users = datasets[0].user_num();
        let n_items = datasets[0].item_num();

        let mut columns = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            let users = dataset
                .column(&config.user_id_field)
                .ok_or_else(|| Error::MissingField(config.user_id_field.clone()))?;
            let items = dataset
                .column(&config.item_id_field)
                .ok_or_else(|| Error::MissingField(config.item_id_field.clone()))?;
            if users.len() != items.len() {
                return Err(Error::InvalidConfig(format!(
                    "fields [{}] and [{}] have different lengths ({} vs {})",
                    config.user_id_field,
                    config.item_id_field,
                    users.len(),
                    items.len()
                )));
            }
            if let Some(&user_id) = users.iter().find(|&&u| u >= n_users) {
                return Err(Error::UserIdOutOfRange(user_id));
            }
            if let Some(&item_id) = items.iter().find(|&&i| i >= n_items) {
                return Err(Error::ItemIdOutOfRange(item_id));
            }
            columns.push((users, items));
        }

        let mut pool: Vec<ItemId> = match distribution {
            Distribution::Uniform => (0..n_items).collect(),
            Distribution::Popularity => columns
                .iter()
                .flat_map(|(_, items)| items.iter().copied())
                .collect(),
        };
        if pool.is_empty() {
            return Err(Error::InvalidConfig("negative sample pool is empty".into()));
        }
        match config.seed {
            Some(seed) => pool.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => pool.shuffle(&mut rand::thread_rng()),
        }

        let mut used_item_ids = HashMap::with_capacity(phases.len());
        let mut last: Vec<HashSet<ItemId>> = vec![HashSet::new(); n_users];
        for (phase, (users, items)) in phases.iter().zip(&columns) {
            let mut cur = last.clone();
            for (&user_id, &item_id) in users.iter().zip(items.iter()) {
                cur[user_id].insert(item_id);
            }
            used_item_ids.insert(phase.to_string(), cur.clone());
            last = cur;
        }

        debug!(
            ?distribution,
            n_users,
            n_items,
            pool_len = pool.len(),
            phases = ?phases,
            "built negative sampler"
        );

        Ok(Self {
            phases: phases.iter().map(|p| p.to_string()).collect(),
            n_users,
            n_items,
            distribution,
            pool,
            cursor: 0,
            used_item_ids,
        })
    }

    /// Single-phase form of [`Sampler::new`].
    pub fn for_phase(
        config: &SamplerConfig,
        phase: &str,
        dataset: &dyn Dataset,
        distribution: &str,
    ) -> Result<Self> {
        Self::new(config, &[phase], &[dataset], distribution)
    }

    /// Draw `num` negatives for each user in `user_ids`.
    ///
    /// The result is user-major: the `num` draws of `user_ids[0]` come first.
    /// Every returned id is a real item the user has not interacted with in
    /// `phase` or any phase declared before it. Draws advance the cursor that
    /// all calls share, so results depend on call order.
    pub fn sample_by_user_ids(
        &mut self,
        phase: &str,
        user_ids: &[UserId],
        num: usize,
    ) -> Result<Vec<ItemId>> {
        let seen_sets = self
            .used_item_ids
            .get(phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?;
        if let Some(&user_id) = user_ids.iter().find(|&&u| u >= self.n_users) {
            return Err(Error::UserIdOutOfRange(user_id));
        }

        let mut neg_item_ids = Vec::with_capacity(user_ids.len() * num);
        for &user_id in user_ids {
            let seen = &seen_sets[user_id];
            for _ in 0..num {
                match draw_unseen(&self.pool, &mut self.cursor, seen) {
                    Some(item_id) => neg_item_ids.push(item_id),
                    None => {
                        warn!(phase, user_id, "pool holds no unseen item for user");
                        return Err(Error::SamplingExhausted {
                            phase: phase.to_string(),
                            user_id,
                        });
                    }
                }
            }
        }
        Ok(neg_item_ids)
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn n_users(&self) -> usize {
        self.n_users
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn pool(&self) -> &[ItemId] {
        &self.pool
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Cumulative seen set of `user_id` for `phase`.
    pub fn used_item_ids(&self, phase: &str, user_id: UserId) -> Option<&HashSet<ItemId>> {
        self.used_item_ids.get(phase)?.get(user_id)
    }
}

/// Consume pool entries from `cursor` until one is neither padding nor seen.
/// Gives up after one full cycle of the pool.
fn draw_unseen(pool: &[ItemId], cursor: &mut usize, seen: &HashSet<ItemId>) -> Option<ItemId> {
    for _ in 0..pool.len() {
        let item_id = pool[*cursor];
        *cursor = (*cursor + 1) % pool.len();
        if item_id != PADDING_ITEM_ID && !seen.contains(&item_id) {
            return Some(item_id);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
