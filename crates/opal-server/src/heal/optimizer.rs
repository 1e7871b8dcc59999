// crates/opal-server/src/heal/optimizer.rs
// Periodic usage-pattern maintenance: prune, decay, merge

use super::usage::{SIMILARITY_THRESHOLD, UsagePattern, UsagePatternStore, jaccard, tokens};
use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// Patterns older than this AND below the keep threshold get deleted.
const PRUNE_AGE_DAYS: i64 = 90;
const PRUNE_CONFIDENCE: f64 = 0.70;

/// Inactivity horizon before decay starts, then 1% per additional month.
const DECAY_AFTER_DAYS: i64 = 30;
const DECAY_PER_MONTH: f64 = 0.99;

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub pruned: usize,
    pub decayed: usize,
    pub merged: usize,
}

impl UsagePatternStore {
    /// Run one maintenance pass against `now` and commit the result.
    pub async fn optimize(&self, now: DateTime<Utc>) -> OptimizeReport {
        let mut patterns = self.all().await;
        let mut report = OptimizeReport::default();

        // Prune: old and never earned trust
        let before = patterns.len();
        patterns.retain(|p| {
            let age = now - p.created;
            !(age > Duration::days(PRUNE_AGE_DAYS) && p.confidence < PRUNE_CONFIDENCE)
        });
        report.pruned = before - patterns.len();

        // Decay: inactive patterns slide back toward forgetting. The decayed
        // value is derived from the formula confidence each pass, so repeated
        // runs within the same month do not compound.
        for pattern in patterns.iter_mut() {
            let idle = now - pattern.last_active;
            if idle > Duration::days(DECAY_AFTER_DAYS) {
                let extra_months = ((idle.num_days() - DECAY_AFTER_DAYS) / 30).max(0) as i32 + 1;
                pattern.recompute_confidence();
                pattern.confidence *= DECAY_PER_MONTH.powi(extra_months);
                report.decayed += 1;
            }
        }

        // Merge: same tool + category, near-identical match+cause
        let merged = merge_similar(patterns, &mut report);

        if report != OptimizeReport::default() {
            info!(
                pruned = report.pruned,
                decayed = report.decayed,
                merged = report.merged,
                "Usage pattern maintenance"
            );
        }
        self.replace_all(merged).await;
        report
    }
}

fn merge_similar(patterns: Vec<UsagePattern>, report: &mut OptimizeReport) -> Vec<UsagePattern> {
    let mut kept: Vec<UsagePattern> = Vec::with_capacity(patterns.len());

    for pattern in patterns {
        let candidate = kept.iter_mut().find(|k| {
            k.tool == pattern.tool
                && k.category == pattern.category
                && jaccard(
                    &tokens(&format!("{} {}", k.match_pattern, k.cause)),
                    &tokens(&format!("{} {}", pattern.match_pattern, pattern.cause)),
                ) >= SIMILARITY_THRESHOLD
        });

        match candidate {
            Some(existing) => {
                existing.observations += pattern.observations;
                existing.prevention_stats.shown += pattern.prevention_stats.shown;
                existing.prevention_stats.prevented += pattern.prevention_stats.prevented;
                existing.prevention_stats.failed += pattern.prevention_stats.failed;
                existing.prevention_stats.false_positive += pattern.prevention_stats.false_positive;
                existing.created = existing.created.min(pattern.created);
                existing.last_seen = existing.last_seen.max(pattern.last_seen);
                existing.last_active = existing.last_active.max(pattern.last_active);
                for rule in pattern.validation_rules {
                    if !existing.validation_rules.contains(&rule) {
                        existing.validation_rules.push(rule);
                    }
                }
                existing.recompute_confidence();
                report.merged += 1;
            }
            None => kept.push(pattern),
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heal::classifier::UsageCategory;
    use crate::heal::usage::PreventionStats;
    use crate::store::Store;
    use std::time::Duration as StdDuration;

    fn store() -> (tempfile::TempDir, UsagePatternStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), StdDuration::from_millis(10));
        (dir, UsagePatternStore::new(store))
    }

    fn pattern_at(tool: &str, cause: &str, confidence: f64, created_days_ago: i64, active_days_ago: i64) -> UsagePattern {
        let now = Utc::now();
        UsagePattern {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            category: UsageCategory::MissingPrerequisite,
            match_pattern: regex::escape(cause),
            cause: cause.to_string(),
            prevention_text: format!("avoid: {cause}"),
            validation_rules: Vec::new(),
            confidence,
            observations: 4,
            prevention_stats: PreventionStats::default(),
            created: now - Duration::days(created_days_ago),
            last_seen: now - Duration::days(active_days_ago),
            last_active: now - Duration::days(active_days_ago),
        }
    }

    #[tokio::test]
    async fn test_prune_requires_both_conditions() {
        let (_dir, store) = store();
        store.insert(pattern_at("t", "old and weak", 0.55, 120, 1)).await.unwrap();
        store.insert(pattern_at("t", "old but trusted", 0.85, 120, 1)).await.unwrap();
        store.insert(pattern_at("t", "young and weak", 0.55, 10, 1)).await.unwrap();

        let report = store.optimize(Utc::now()).await;
        assert_eq!(report.pruned, 1);
        let remaining = store.all().await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.cause != "old and weak"));
    }

    #[tokio::test]
    async fn test_decay_applies_to_inactive() {
        let (_dir, store) = store();
        store.insert(pattern_at("t", "stale entry", 0.9, 10, 95)).await.unwrap();
        let report = store.optimize(Utc::now()).await;
        assert_eq!(report.decayed, 1);
        let p = &store.all().await[0];
        // Formula confidence for obs=4, neutral rate, decayed 3 months
        let expected = UsagePattern::confidence_for(4, 0.5) * 0.99f64.powi(3);
        assert!((p.confidence - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_decay_idempotent_within_month() {
        let (_dir, store) = store();
        store.insert(pattern_at("t", "stale entry", 0.9, 10, 40)).await.unwrap();
        let now = Utc::now();
        store.optimize(now).await;
        let first = store.all().await[0].confidence;
        store.optimize(now).await;
        let second = store.all().await[0].confidence;
        assert!((first - second).abs() < 1e-9, "re-running must not compound decay");
    }

    #[tokio::test]
    async fn test_merge_sums_observations() {
        let (_dir, store) = store();
        store.insert(pattern_at("t", "no active sprint", 0.6, 5, 1)).await.unwrap();
        store.insert(pattern_at("t", "no active sprint found", 0.6, 3, 2)).await.unwrap();
        store.insert(pattern_at("other", "no active sprint", 0.6, 3, 2)).await.unwrap();

        let report = store.optimize(Utc::now()).await;
        assert_eq!(report.merged, 1);
        let all = store.all().await;
        assert_eq!(all.len(), 2);
        let merged = all.iter().find(|p| p.tool == "t").unwrap();
        assert_eq!(merged.observations, 8);
    }
}
