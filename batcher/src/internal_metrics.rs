use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct InternalMetrics {
    pub(crate) queue_overflow: Counter,
    pub(crate) queue_batch_processed: Counter,
    pub(crate) queue_batch_failed: Counter,
    pub(crate) queue_batch_panicked: Counter,
    pub(crate) queue_batch_retry: Counter,
}

#[derive(Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/**
A point-in-time view of a channel's health counters.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ChannelMetrics {
    /**
    The number of items waiting for the next batch.
    */
    pub queue_length: usize,
    /**
    The number of times pending items were discarded because the channel was full.
    */
    pub queue_overflow: usize,
    /**
    The number of batches processed successfully.
    */
    pub queue_batch_processed: usize,
    /**
    The number of failed batch attempts, including ones that were later retried.
    */
    pub queue_batch_failed: usize,
    /**
    The number of batches dropped because processing them panicked.
    */
    pub queue_batch_panicked: usize,
    /**
    The number of retries issued for failed batches.
    */
    pub queue_batch_retry: usize,
}

impl InternalMetrics {
    pub fn sample(&self, queue_length: usize) -> ChannelMetrics {
        let InternalMetrics {
            queue_overflow,
            queue_batch_processed,
            queue_batch_failed,
            queue_batch_panicked,
            queue_batch_retry,
        } = self;

        ChannelMetrics {
            queue_length,
            queue_overflow: queue_overflow.sample(),
            queue_batch_processed: queue_batch_processed.sample(),
            queue_batch_failed: queue_batch_failed.sample(),
            queue_batch_panicked: queue_batch_panicked.sample(),
            queue_batch_retry: queue_batch_retry.sample(),
        }
    }
}
