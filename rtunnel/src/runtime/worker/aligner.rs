//! Exactly-once barrier alignment over the local inputs of a task.
//!
//! Once a barrier arrived on an input, that input is blocked (not read) until the barrier
//! arrived on every other live input. An input that ended counts as aligned for every
//! later barrier.

use crate::api::checkpoint::CheckpointBarrier;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum AlignResult {
    /// still waiting for the barrier on other inputs
    Pending,
    /// snapshot now, then forward the barrier and unblock every input
    Aligned(CheckpointBarrier),
}

#[derive(Debug)]
pub(crate) struct BarrierAligner {
    current: Option<CheckpointBarrier>,
    received: Vec<bool>,
    ended: Vec<bool>,
}

impl BarrierAligner {
    pub fn new(num_inputs: usize) -> Self {
        BarrierAligner {
            current: None,
            received: vec![false; num_inputs],
            ended: vec![false; num_inputs],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.received.len()
    }

    /// Whether elements may be consumed from `input` right now.
    pub fn is_readable(&self, input: usize) -> bool {
        !self.received[input] && !self.ended[input]
    }

    pub fn all_ended(&self) -> bool {
        self.ended.iter().all(|x| *x)
    }

    pub fn pending_barrier(&self) -> Option<CheckpointBarrier> {
        self.current
    }

    pub fn on_barrier(
        &mut self,
        input: usize,
        barrier: CheckpointBarrier,
    ) -> anyhow::Result<AlignResult> {
        match self.current {
            Some(current) if current.checkpoint_id != barrier.checkpoint_id => {
                if barrier.checkpoint_id > current.checkpoint_id {
                    // the older checkpoint can never complete, start over with the new one
                    warn!(
                        "{} overtook {} during alignment",
                        barrier.checkpoint_id, current.checkpoint_id
                    );
                    self.reset();
                    self.current = Some(barrier);
                } else {
                    return Err(anyhow!(
                        "stale {} on input {} while aligning {}",
                        barrier.checkpoint_id,
                        input,
                        current.checkpoint_id
                    ));
                }
            }
            Some(_) => {}
            None => self.current = Some(barrier),
        }

        if self.received[input] {
            return Err(anyhow!(
                "duplicate {} on input {}",
                barrier.checkpoint_id,
                input
            ));
        }
        self.received[input] = true;
        Ok(self.try_align())
    }

    /// An ended input never delivers the pending barrier; it no longer holds alignment up.
    pub fn on_end(&mut self, input: usize) -> AlignResult {
        self.ended[input] = true;
        if self.current.is_some() {
            self.try_align()
        } else {
            AlignResult::Pending
        }
    }

    fn try_align(&mut self) -> AlignResult {
        let aligned = self
            .received
            .iter()
            .zip(self.ended.iter())
            .all(|(received, ended)| *received || *ended);
        if !aligned {
            return AlignResult::Pending;
        }

        match self.current.take() {
            Some(barrier) => {
                self.reset();
                AlignResult::Aligned(barrier)
            }
            None => AlignResult::Pending,
        }
    }

    fn reset(&mut self) {
        self.current = None;
        for r in self.received.iter_mut() {
            *r = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::checkpoint::{CheckpointBarrier, CheckpointType};
    use crate::api::runtime::CheckpointId;
    use crate::runtime::worker::aligner::{AlignResult, BarrierAligner};

    fn barrier(id: u64) -> CheckpointBarrier {
        CheckpointBarrier {
            checkpoint_id: CheckpointId(id),
            timestamp: 0,
            checkpoint_type: CheckpointType::Checkpoint,
        }
    }

    #[test]
    pub fn single_input_test() {
        let mut aligner = BarrierAligner::new(1);
        assert_eq!(
            aligner.on_barrier(0, barrier(1)).unwrap(),
            AlignResult::Aligned(barrier(1))
        );
        assert!(aligner.is_readable(0));
    }

    #[test]
    pub fn block_until_aligned_test() {
        let mut aligner = BarrierAligner::new(2);
        assert_eq!(aligner.on_barrier(0, barrier(1)).unwrap(), AlignResult::Pending);
        assert!(!aligner.is_readable(0));
        assert!(aligner.is_readable(1));
        assert_eq!(aligner.pending_barrier(), Some(barrier(1)));

        assert_eq!(
            aligner.on_barrier(1, barrier(1)).unwrap(),
            AlignResult::Aligned(barrier(1))
        );
        assert!(aligner.is_readable(0));
        assert!(aligner.is_readable(1));
        assert_eq!(aligner.pending_barrier(), None);
    }

    #[test]
    pub fn ended_input_releases_alignment_test() {
        let mut aligner = BarrierAligner::new(2);
        assert_eq!(aligner.on_barrier(0, barrier(1)).unwrap(), AlignResult::Pending);
        assert_eq!(aligner.on_end(1), AlignResult::Aligned(barrier(1)));
        assert!(!aligner.is_readable(1));
        assert!(!aligner.all_ended());

        // later barriers align on the live input alone
        assert_eq!(
            aligner.on_barrier(0, barrier(2)).unwrap(),
            AlignResult::Aligned(barrier(2))
        );
        assert_eq!(aligner.on_end(0), AlignResult::Pending);
        assert!(aligner.all_ended());
    }

    #[test]
    pub fn newer_barrier_overtakes_test() {
        let mut aligner = BarrierAligner::new(3);
        aligner.on_barrier(0, barrier(1)).unwrap();
        assert_eq!(aligner.on_barrier(1, barrier(2)).unwrap(), AlignResult::Pending);
        assert!(aligner.is_readable(0));
        assert!(aligner.on_barrier(2, barrier(1)).is_err());
        assert!(aligner.on_barrier(1, barrier(2)).is_err());
    }
}
