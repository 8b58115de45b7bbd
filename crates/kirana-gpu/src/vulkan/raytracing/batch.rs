//! Size-bounded grouping of bottom-level builds.

use ash::vk;
use log::warn;

/// Records built together in one command buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchGroup {
    /// Record indices, ascending.
    pub indices: Vec<usize>,
    /// Sum of the records' structure sizes.
    pub total_size: vk::DeviceSize,
}

impl BatchGroup {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Split `sizes` into consecutive groups whose sums stay within `limit`.
///
/// A new group starts whenever adding the next size would exceed the limit.
/// A size larger than the limit on its own ends up alone in its group.
pub fn batch_by_limit(sizes: &[vk::DeviceSize], limit: vk::DeviceSize) -> Vec<BatchGroup> {
    let mut batches = Vec::new();
    let mut current = BatchGroup::default();

    for (index, &size) in sizes.iter().enumerate() {
        if size > limit {
            warn!("Structure {} ({} bytes) exceeds the batch limit of {} bytes; building it alone", index, size, limit);
        }
        if !current.is_empty() && current.total_size.saturating_add(size) > limit {
            batches.push(std::mem::take(&mut current));
        }
        current.indices.push(index);
        current.total_size = current.total_size.saturating_add(size);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: vk::DeviceSize = 1024 * 1024;

    fn indices(batches: &[BatchGroup]) -> Vec<Vec<usize>> {
        batches.iter().map(|b| b.indices.clone()).collect()
    }

    #[test]
    fn test_each_record_alone_when_pairs_exceed_limit() {
        let batches = batch_by_limit(&[10 * MB, 10 * MB, 10 * MB], 15 * MB);
        assert_eq!(indices(&batches), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_small_records_share_one_batch() {
        let batches = batch_by_limit(&[4 * MB, 4 * MB, 4 * MB], 15 * MB);
        assert_eq!(indices(&batches), vec![vec![0, 1, 2]]);
        assert_eq!(batches[0].total_size, 12 * MB);
    }

    #[test]
    fn test_exact_fit_stays_in_batch() {
        let batches = batch_by_limit(&[5, 5, 5], 10);
        assert_eq!(indices(&batches), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_oversized_record_isolated() {
        let batches = batch_by_limit(&[2 * MB, 40 * MB, 3 * MB, 4 * MB], 15 * MB);
        assert_eq!(indices(&batches), vec![vec![0], vec![1], vec![2, 3]]);
        for batch in &batches {
            assert!(batch.total_size <= 15 * MB || batch.len() == 1);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(batch_by_limit(&[], 15 * MB).is_empty());
    }

    #[test]
    fn test_batches_are_ordered_and_exhaustive() {
        let sizes: Vec<vk::DeviceSize> = (0..50).map(|i| (i * 7919 % 13 + 1) * MB).collect();
        let batches = batch_by_limit(&sizes, 20 * MB);

        let flattened: Vec<usize> = batches.iter().flat_map(|b| b.indices.iter().copied()).collect();
        assert_eq!(flattened, (0..sizes.len()).collect::<Vec<_>>());

        for batch in &batches {
            assert!(!batch.is_empty());
            assert!(batch.total_size <= 20 * MB || batch.len() == 1);
            let sum: vk::DeviceSize = batch.indices.iter().map(|&i| sizes[i]).sum();
            assert_eq!(sum, batch.total_size);
        }
    }
}
