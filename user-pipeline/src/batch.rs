use crate::record::Record;
use crate::types::SourcePosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    max_records: usize,
    max_bytes: Option<usize>,
}

impl BatchLimits {
    /// A zero count bound is treated as one, every record is flushed on its own.
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<usize>) -> Self {
        self.max_bytes = max_bytes.filter(|bytes| *bytes > 0);
        self
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes
    }
}

/// Ordered records of one partition, flushed exactly once and then dropped.
#[derive(Debug)]
pub struct Batch<T> {
    records: Vec<Record<T>>,
    size_bytes: usize,
}

impl<T> Batch<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            size_bytes: 0,
        }
    }

    fn push(&mut self, record: Record<T>) {
        self.size_bytes += record.size_bytes();
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn records(&self) -> &[Record<T>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record<T>> {
        self.records
    }

    /// Highest position covered by this batch. Records arrive in offset order
    /// from a single partition, so this is the last one.
    pub fn last_position(&self) -> Option<&SourcePosition> {
        self.records.last().map(Record::position)
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

/// Single-writer buffer owned by one partition worker.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    limits: BatchLimits,
    current: Batch<T>,
}

impl<T> BatchAccumulator<T> {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            current: Batch::with_capacity(limits.max_records),
        }
    }

    /// Appends a record. Returns a completed batch when the count bound is
    /// reached, or when the record would push the resident batch over the byte
    /// bound; in that case the resident batch is returned and the record starts
    /// the next one.
    pub fn add(&mut self, record: Record<T>) -> Option<Batch<T>> {
        if self.would_overflow_bytes(&record) {
            let full = self.swap();
            self.current.push(record);
            return Some(full);
        }

        self.current.push(record);
        if self.current.len() >= self.limits.max_records {
            return Some(self.swap());
        }
        None
    }

    /// Hands out the resident batch regardless of the thresholds, used when draining.
    pub fn take(&mut self) -> Option<Batch<T>> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.swap())
        }
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn would_overflow_bytes(&self, record: &Record<T>) -> bool {
        match self.limits.max_bytes {
            Some(max_bytes) => {
                !self.current.is_empty()
                    && self.current.size_bytes() + record.size_bytes() > max_bytes
            }
            None => false,
        }
    }

    fn swap(&mut self) -> Batch<T> {
        std::mem::replace(
            &mut self.current,
            Batch::with_capacity(self.limits.max_records),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::User;
    use crate::types::Partition;
    use test_case::test_case;

    fn record(offset: i64, size_bytes: usize) -> Record<User> {
        Record::new(
            SourcePosition::new(Partition::new("users", 0), offset),
            User::new(offset),
            size_bytes,
        )
    }

    fn feed(accumulator: &mut BatchAccumulator<User>, count: i64) -> Vec<Batch<User>> {
        let mut batches: Vec<_> = (0..count)
            .filter_map(|offset| accumulator.add(record(offset, 10)))
            .collect();
        batches.extend(accumulator.take());
        batches
    }

    #[test_case(250, 100, &[100, 100, 50]; "partial last batch")]
    #[test_case(200, 100, &[100, 100]; "exact multiple")]
    #[test_case(7, 1, &[1, 1, 1, 1, 1, 1, 1]; "threshold of one")]
    #[test_case(3, 10, &[3]; "fewer than threshold")]
    #[test_case(0, 10, &[]; "no records")]
    fn emits_ceil_n_over_t_batches(count: i64, threshold: usize, expected: &[usize]) {
        let mut accumulator = BatchAccumulator::new(BatchLimits::new(threshold));
        let sizes: Vec<_> = feed(&mut accumulator, count)
            .iter()
            .map(Batch::len)
            .collect();
        assert_eq!(sizes, expected);
    }

    #[test]
    fn batches_keep_arrival_order() {
        let mut accumulator = BatchAccumulator::new(BatchLimits::new(4));
        let offsets: Vec<_> = feed(&mut accumulator, 10)
            .into_iter()
            .flat_map(Batch::into_records)
            .map(|record| record.position().offset())
            .collect();
        assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn take_resets_to_empty() {
        let mut accumulator = BatchAccumulator::new(BatchLimits::new(10));
        assert!(accumulator.take().is_none());

        assert!(accumulator.add(record(0, 10)).is_none());
        assert!(accumulator.add(record(1, 10)).is_none());
        assert_eq!(accumulator.len(), 2);

        let batch = accumulator.take().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes(), 20);
        assert_eq!(batch.last_position().map(SourcePosition::offset), Some(1));
        assert!(accumulator.is_empty());
        assert!(accumulator.take().is_none());
    }

    #[test]
    fn byte_overflow_flushes_resident_batch_first() {
        let limits = BatchLimits::new(100).with_max_bytes(Some(25));
        let mut accumulator = BatchAccumulator::new(limits);

        assert!(accumulator.add(record(0, 10)).is_none());
        assert!(accumulator.add(record(1, 10)).is_none());

        let full = accumulator.add(record(2, 10)).unwrap();
        assert_eq!(full.len(), 2);
        assert_eq!(full.size_bytes(), 20);
        assert_eq!(accumulator.len(), 1);
    }

    #[test]
    fn oversized_record_gets_its_own_batch() {
        let limits = BatchLimits::new(100).with_max_bytes(Some(25));
        let mut accumulator = BatchAccumulator::new(limits);

        // An empty batch always accepts a record, even one above the byte bound
        assert!(accumulator.add(record(0, 40)).is_none());
        let alone = accumulator.add(record(1, 5)).unwrap();
        assert_eq!(alone.len(), 1);
        assert_eq!(alone.size_bytes(), 40);
    }

    #[test]
    fn zero_limits_are_clamped() {
        let limits = BatchLimits::new(0).with_max_bytes(Some(0));
        assert_eq!(limits.max_records(), 1);
        assert_eq!(limits.max_bytes(), None);
    }
}
