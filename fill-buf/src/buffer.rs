// Copyright (c) Facebook, Inc. and its affiliates.
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};

use resctrl_selftest_intf::FillOp;

pub const CACHE_LINE_SIZE: usize = 64;
const WORDS_PER_LINE: usize = CACHE_LINE_SIZE / std::mem::size_of::<u64>();

/// The memory the workload streams through. Every cache line of it is
/// touched once per pass.
pub struct FillBuf {
    words: Vec<u64>,
}

impl FillBuf {
    /// `span` is rounded up to whole cache lines. The contents are random so
    /// that nothing gets away with zero pages.
    pub fn new(span: u64) -> Self {
        let nr_lines = ((span as usize + CACHE_LINE_SIZE - 1) / CACHE_LINE_SIZE).max(1);
        let mut rng = SmallRng::from_entropy();
        let words = (0..nr_lines * WORDS_PER_LINE).map(|_| rng.gen()).collect();
        Self { words }
    }

    pub fn len(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }

    /// Reads the first word of every line and returns their sum.
    pub fn read_pass(&self) -> u64 {
        let mut sum = 0u64;
        for line in self.words.chunks(WORDS_PER_LINE) {
            sum = sum.wrapping_add(black_box(line[0]));
        }
        sum
    }

    /// Overwrites the first word of every line.
    pub fn write_pass(&mut self, seq: u64) {
        for (idx, line) in self.words.chunks_mut(WORDS_PER_LINE).enumerate() {
            line[0] = black_box(seq.wrapping_add(idx as u64));
        }
    }

    /// Runs passes until `stop` is set. Returns the number of passes and the
    /// accumulated read sum.
    pub fn run(&mut self, op: FillOp, stop: &AtomicBool) -> (u64, u64) {
        let mut nr_passes = 0u64;
        let mut sum = 0u64;
        while !stop.load(Ordering::Relaxed) {
            match op {
                FillOp::Read => sum = sum.wrapping_add(self.read_pass()),
                FillOp::Write => self.write_pass(nr_passes),
            }
            nr_passes += 1;
        }
        (nr_passes, sum)
    }
}

#[cfg(test)]
mod tests {
    use super::{FillBuf, CACHE_LINE_SIZE};
    use resctrl_selftest_intf::FillOp;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_size_and_passes() {
        let buf = FillBuf::new(1000);
        assert_eq!(buf.len(), 16 * CACHE_LINE_SIZE);
        assert_eq!(FillBuf::new(0).len(), CACHE_LINE_SIZE);

        let mut buf = FillBuf::new(4 * CACHE_LINE_SIZE as u64);
        buf.write_pass(10);
        assert_eq!(buf.read_pass(), 10 + 11 + 12 + 13);
    }

    #[test]
    fn test_run_stops() {
        let _ = ::env_logger::try_init();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_copy = stop.clone();
        let jh = std::thread::spawn(move || {
            let mut buf = FillBuf::new(1 << 16);
            buf.run(FillOp::Write, &stop_copy)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        let (nr_passes, _) = jh.join().unwrap();
        assert!(nr_passes > 0);

        // Already stopped, no pass at all.
        let mut buf = FillBuf::new(1 << 16);
        assert_eq!(buf.run(FillOp::Read, &stop), (0, 0));
    }
}
