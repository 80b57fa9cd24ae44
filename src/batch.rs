// ✂️ Batch Splitter - fixed-size chunks for bounded parallel processing

/// One chunk of the input, remembering where it sits in the phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    /// 1-based position of this batch in the phase
    pub number: usize,
    /// Total batches in the phase
    pub of: usize,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split `items` into batches of at most `batch_size` (a size of 0 is treated
/// as 1). Order is preserved across and within batches.
pub fn split<T>(items: Vec<T>, batch_size: usize) -> Vec<Batch<T>> {
    let size = batch_size.max(1);
    let of = items.len().div_ceil(size);

    let mut batches = Vec::with_capacity(of);
    let mut iter = items.into_iter().peekable();
    let mut number = 0;

    while iter.peek().is_some() {
        number += 1;
        let chunk: Vec<T> = iter.by_ref().take(size).collect();
        batches.push(Batch {
            number,
            of,
            items: chunk,
        });
    }

    batches
}
