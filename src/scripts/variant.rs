// Optimize/standard variant selection per conformer group

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::config::ScriptConfig;
use crate::models::{Job, ScriptVariant};

/// How many jobs of each group get the optimize variant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantPolicy {
    /// Percentage (0-100) when `use_percent`, else a literal count
    pub amount: f64,
    pub use_percent: bool,
}

impl VariantPolicy {
    pub fn from_config(config: &ScriptConfig) -> Self {
        Self {
            amount: config.optimize_amount,
            use_percent: config.use_percent,
        }
    }

    /// Number of optimize jobs in a group of `n`
    pub fn optimize_count(&self, n: usize) -> usize {
        let k = if self.use_percent {
            (self.amount / 100.0 * n as f64).round()
        } else {
            self.amount.round()
        };
        (k.max(0.0) as usize).min(n)
    }
}

fn by_rank(a: &Job, b: &Job) -> Ordering {
    match (a.group.rank, b.group.rank) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.name.cmp(&b.name))
}

/// Variant per job of one group: the `k` lowest ranks optimize, the rest
/// stay standard. Jobs without a rank sort last.
pub fn select_variant(jobs: &[Job], amount: f64, use_percent: bool) -> Vec<(String, ScriptVariant)> {
    let k = VariantPolicy { amount, use_percent }.optimize_count(jobs.len());
    let mut sorted: Vec<&Job> = jobs.iter().collect();
    sorted.sort_by(|a, b| by_rank(a, b));
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, job)| {
            let variant = if i < k {
                ScriptVariant::Optimize
            } else {
                ScriptVariant::Standard
            };
            (job.name.clone(), variant)
        })
        .collect()
}

/// Group jobs by base name and apply [`select_variant`] per group; the input
/// order is preserved
pub fn assign_variants(jobs: Vec<Job>, policy: VariantPolicy) -> Vec<Job> {
    let mut groups: BTreeMap<String, Vec<Job>> = BTreeMap::new();
    for job in &jobs {
        groups
            .entry(job.group.base.clone())
            .or_default()
            .push(job.clone());
    }

    let variants: HashMap<String, ScriptVariant> = groups
        .values()
        .flat_map(|group| select_variant(group, policy.amount, policy.use_percent))
        .collect();

    jobs.into_iter()
        .map(|job| {
            let variant = variants.get(&job.name).copied().unwrap_or_default();
            job.with_variant(variant)
        })
        .collect()
}
