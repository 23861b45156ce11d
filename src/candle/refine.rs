use super::block::{FftResBlock, ResBlock};
use super::op::FftNorm;
use super::sam::Sam;
use candle_core::{Error, Result, Tensor};
use candle_nn::{Module, VarBuilder};

/// How a refinement step treats the spatial mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepGate {
    /// The residual branch is added unscaled.
    Plain,
    /// A new mask is computed from the running features, then applied.
    Refresh,
    /// The current mask is applied.
    Masked,
}

/// Layout of the refinement chain: `lead` plain steps, `groups` runs of
/// `group_len` masked steps sharing one SAM mask each, then `tail` plain
/// steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefineSchedule {
    pub lead: usize,
    pub groups: usize,
    pub group_len: usize,
    pub tail: usize,
}

impl Default for RefineSchedule {
    // 3 + 4 * 3 + 2 = 17 steps
    fn default() -> Self {
        Self {
            lead: 3,
            groups: 4,
            group_len: 3,
            tail: 2,
        }
    }
}

impl RefineSchedule {
    pub fn steps(&self) -> usize {
        self.lead + self.groups * self.group_len + self.tail
    }

    /// Number of SAM evaluations per forward pass.
    pub fn sam_calls(&self) -> usize {
        self.groups
    }

    pub fn gate(&self, step: usize) -> StepGate {
        let masked = self.groups * self.group_len;
        match step.checked_sub(self.lead) {
            Some(i) if i < masked && i % self.group_len == 0 => StepGate::Refresh,
            Some(i) if i < masked => StepGate::Masked,
            _ => StepGate::Plain,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups == 0 || self.group_len == 0 {
            return Err(Error::Msg(format!(
                "refine schedule needs at least one masked step, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// Sequence of `relu(res(x) [* mask] + x + fft(x))` steps gated by a shared SAM.
#[derive(Debug)]
pub struct RefineChain {
    res_blocks: Vec<ResBlock>,
    fft_blocks: Vec<FftResBlock>,
    schedule: RefineSchedule,
    span: tracing::Span,
}

impl RefineChain {
    /// Blocks are read from `res_block{i}` / `fft_block{i}` with `i` starting at 1.
    pub fn load(vb: VarBuilder, width: usize, schedule: RefineSchedule, norm: FftNorm) -> Result<Self> {
        schedule.validate()?;
        let n = schedule.steps();
        let mut res_blocks = Vec::with_capacity(n);
        let mut fft_blocks = Vec::with_capacity(n);
        for i in 1..=n {
            res_blocks.push(ResBlock::load(vb.pp(format!("res_block{i}")), width, width)?);
            fft_blocks.push(FftResBlock::load(vb.pp(format!("fft_block{i}")), width, width, norm)?);
        }
        Ok(Self {
            res_blocks,
            fft_blocks,
            schedule,
            span: tracing::span!(tracing::Level::TRACE, "refine"),
        })
    }

    pub fn schedule(&self) -> RefineSchedule {
        self.schedule
    }

    /// Runs every step and returns `(last_mask, features)`.
    pub fn forward(&self, xs: &Tensor, sam: &Sam) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let mut out = xs.clone();
        let mut mask: Option<Tensor> = None;
        for (step, (res, fft)) in self.res_blocks.iter().zip(self.fft_blocks.iter()).enumerate() {
            let gate = self.schedule.gate(step);
            if gate == StepGate::Refresh {
                mask = Some(sam.forward(&out)?);
            }
            let branch = res.forward(&out)?;
            let branch = match (gate, &mask) {
                (StepGate::Refresh | StepGate::Masked, Some(mask)) => branch.broadcast_mul(mask)?,
                _ => branch,
            };
            out = ((branch + &out)? + fft.forward(&out)?)?.relu()?;
        }
        match mask {
            Some(mask) => Ok((mask, out)),
            None => Err(Error::Msg("refine chain finished without computing a mask".into())),
        }
    }
}
