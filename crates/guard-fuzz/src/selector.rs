//! Picks the next uncovered basic block to aim the LLM at.
//!
//! Scoring is `branching_factor × decay(attempts)`: blocks with more CFG
//! successors are worth more, and every 64 unsuccessful attempts multiply a
//! block's weight by 0.9 so the selector drifts away from hopeless targets.

use std::path::PathBuf;

use itertools::Itertools;
use tracing::debug;

use crate::{
    cfg::{BasicBlock, Cfg, FunctionCfg},
    coverage::{CoverageMap, LineId},
};

const DECAY_FACTOR: f64 = 0.9;
const DECAY_WINDOW: u32 = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("focused function `{0}` is not in the CFG dump")]
    UnknownFunction(String),
    #[error("no focused functions configured")]
    NoFocus,
}

/// Everything the prompt builder needs to describe one coverage target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub function: String,
    pub bb_id: u32,
    pub successor_count: usize,
    pub lines: Vec<u32>,
    pub file: Option<PathBuf>,
    pub base_seed_id: Option<u64>,
    pub base_seed_line: Option<u32>,
    pub distance_from_base: Option<u32>,
}

impl TargetInfo {
    /// The line the prompt points the LLM at: the first line of the block.
    pub fn target_line(&self) -> Option<u32> {
        self.lines.first().copied()
    }
}

/// Owns the CFG model and its per-block attempt counters.
#[derive(Debug)]
pub struct TargetSelector {
    cfg: Cfg,
    focus: Vec<String>,
}

impl TargetSelector {
    /// Focused functions must exist in the CFG; unknown names are a
    /// configuration error.
    pub fn new(cfg: Cfg, focus: Vec<String>) -> Result<Self, SelectorError> {
        if focus.is_empty() {
            return Err(SelectorError::NoFocus);
        }
        for name in &focus {
            if !cfg.functions.contains_key(name) {
                return Err(SelectorError::UnknownFunction(name.clone()));
            }
        }
        Ok(Self { cfg, focus })
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    /// Picks the highest-weight uncovered block, or `None` when every
    /// targetable block of every focused function has been covered.
    pub fn select(&self, map: &CoverageMap) -> Option<TargetInfo> {
        let (weight, name, function, block) = self
            .focus
            .iter()
            .flat_map(|name| {
                let function = &self.cfg.functions[name];
                function
                    .blocks
                    .values()
                    .filter(|block| is_candidate(block, map))
                    .map(move |block| (block_weight(block), name.as_str(), function, block))
            })
            // Descending weight, ties broken by ascending (function, bb) for
            // determinism.
            .sorted_by(|a, b| {
                b.0.total_cmp(&a.0)
                    .then_with(|| (a.1, a.3.id).cmp(&(b.1, b.3.id)))
            })
            .next()?;
        let (base_seed_id, base_seed_line, distance_from_base) =
            resolve_base(function, block, map);
        debug!(
            function = name,
            bb = block.id,
            weight,
            base_seed = base_seed_id,
            "Target selected"
        );
        Some(TargetInfo {
            function: name.to_owned(),
            bb_id: block.id,
            successor_count: block.succs.len(),
            lines: block.lines.iter().copied().collect(),
            file: block.source_file.clone(),
            base_seed_id,
            base_seed_line,
            distance_from_base,
        })
    }

    /// True when [`select`](Self::select) would return `None`.
    pub fn all_covered(&self, map: &CoverageMap) -> bool {
        self.focus.iter().all(|name| {
            self.cfg.functions[name]
                .blocks
                .values()
                .all(|block| !is_candidate(block, map))
        })
    }

    /// The first focused function, in configuration order, that still has an
    /// uncovered block. Used as the divergence hint.
    pub fn first_uncovered_function(&self, map: &CoverageMap) -> Option<&str> {
        self.focus
            .iter()
            .find(|name| {
                self.cfg.functions[*name]
                    .blocks
                    .values()
                    .any(|block| is_candidate(block, map))
            })
            .map(String::as_str)
    }

    pub fn record_attempt(&mut self, target: &TargetInfo) {
        if let Some(block) = self.block_mut(target) {
            block.attempts += 1;
        }
    }

    pub fn record_success(&mut self, target: &TargetInfo) {
        if let Some(block) = self.block_mut(target) {
            block.attempts = 0;
            block.successes += 1;
        }
    }

    fn block_mut(&mut self, target: &TargetInfo) -> Option<&mut BasicBlock> {
        self.cfg
            .functions
            .get_mut(&target.function)?
            .blocks
            .get_mut(&target.bb_id)
    }
}

/// A candidate is a block with source lines, none of them covered, that has
/// never been reached. A block that was reached once stays reached.
fn is_candidate(block: &BasicBlock, map: &CoverageMap) -> bool {
    if !block.is_targetable() || block.successes > 0 {
        return false;
    }
    let Some(file) = &block.source_file else {
        return false;
    };
    block.lines.iter().all(|&line| !map.is_covered(file, line))
}

fn block_weight(block: &BasicBlock) -> f64 {
    let branching_factor = block.succs.len().max(1) as f64;
    branching_factor * DECAY_FACTOR.powi((block.attempts / DECAY_WINDOW) as i32)
}

/// Resolves the base seed for a target: a covered CFG predecessor when one
/// exists (distance 1), else the closest covered line in the target's file
/// (distance `|target_line − base_line|`), else nothing.
fn resolve_base(
    function: &FunctionCfg,
    block: &BasicBlock,
    map: &CoverageMap,
) -> (Option<u64>, Option<u32>, Option<u32>) {
    // Predecessor ids and line sets are sorted, so the first covered line
    // found is the lexicographically first (bb_id, line) pair.
    for &pred_id in &block.preds {
        let Some(pred) = function.block(pred_id) else {
            continue;
        };
        let Some(file) = &pred.source_file else {
            continue;
        };
        for &line in &pred.lines {
            let line_id = LineId::new(file.clone(), line);
            if let Some(seed) = map.seed_for_line(&line_id) {
                return (Some(seed), Some(line), Some(1));
            }
        }
    }

    if let (Some(file), Some(target_line)) = (&block.source_file, block.lines.first().copied())
        && let Some((line_id, seed)) = map.find_closest_covered_line(file, target_line)
    {
        let distance = line_id.line.abs_diff(target_line);
        return (Some(seed), Some(line_id.line), Some(distance));
    }

    (None, None, None)
}
