use crate::index::MetadataIndex;
use crate::{BackupId, BackupRecord, LockFilter, Result};

/// Count-based retention: keep at most `limit` backups, removing the oldest
/// unlocked ones first. Locked backups are never selected, even when that
/// leaves the total above the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub limit: usize,
}

impl RetentionPolicy {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Picks which backups to remove given the total count and the unlocked
    /// backups ordered oldest first.
    pub fn select_prune_candidates(
        &self,
        total: usize,
        unlocked_oldest_first: &[BackupRecord],
    ) -> Vec<BackupId> {
        if total <= self.limit {
            return Vec::new();
        }
        let excess = total - self.limit;
        unlocked_oldest_first
            .iter()
            .take(excess)
            .map(|backup| backup.id.clone())
            .collect()
    }

    /// Reads the index and returns the prune candidates in removal order.
    pub fn plan(&self, index: &MetadataIndex) -> Result<Vec<BackupId>> {
        let total = index.count_backups()?;
        if total <= self.limit {
            return Ok(Vec::new());
        }
        let unlocked = index.list_backups(LockFilter::Unlocked)?;
        Ok(self.select_prune_candidates(total, &unlocked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backups(ids: &[&str]) -> Vec<BackupRecord> {
        ids.iter()
            .map(|id| BackupRecord::new(id.to_string(), 0, None))
            .collect()
    }

    #[test]
    fn test_under_limit_is_noop() {
        let policy = RetentionPolicy::new(5);
        assert!(policy.select_prune_candidates(5, &backups(&["a", "b"])).is_empty());
    }

    #[test]
    fn test_removes_oldest_first() {
        let policy = RetentionPolicy::new(2);
        assert_eq!(
            policy.select_prune_candidates(4, &backups(&["a", "b", "c", "d"])),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_locked_backups_bound_removal() {
        // 5 backups, 3 locked: only the 2 unlocked ones can go.
        let policy = RetentionPolicy::new(1);
        assert_eq!(
            policy.select_prune_candidates(5, &backups(&["x", "y"])),
            vec!["x".to_string(), "y".to_string()]
        );
    }

    #[test]
    fn test_plan_reads_index() {
        let index = MetadataIndex::in_memory().unwrap();
        for (i, id) in ["aaaaaa", "bbbbbb", "cccccc"].iter().enumerate() {
            let mut record = BackupRecord::new(id.to_string(), 0, None);
            record.created_at = record.created_at + chrono::Duration::seconds(i as i64);
            index.commit_backup(&record, &[]).unwrap();
        }
        index.set_locked("aaaaaa", true).unwrap();

        let plan = RetentionPolicy::new(1).plan(&index).unwrap();
        assert_eq!(plan, vec!["bbbbbb".to_string(), "cccccc".to_string()]);
    }
}
