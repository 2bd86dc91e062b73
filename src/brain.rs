//! The logic brain: a named-variable blackboard fed from detection results,
//! a priority-ordered rule pass, and the six-state lifecycle machine.

use std::time::Instant;

use thiserror::Error;

use crate::expr;
use crate::shm::{Header, MAX_RESULTS};
use crate::types::{ActionCommand, ActionKind, DecisionRule, GameState, Point2, VisionResult};

/// Rules the brain will hold at most.
pub const MAX_RULES: usize = 256;

/// Live variable names the blackboard will hold at most.
pub const MAX_VARIABLES: usize = 64;

/// Longest variable name the blackboard distinguishes.
const VAR_NAME_MAX: usize = 31;

/// Press duration stamped on rule-selected actions, in milliseconds.
const ACTION_DURATION_MS: i32 = 50;

/// Randomization factor stamped on rule-selected actions.
const ACTION_RANDOMIZE: f32 = 0.3;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("rule count {0} out of range 1..={MAX_RULES}")]
    RuleCountOutOfRange(usize),

    #[error("variable table full ({MAX_VARIABLES} names live)")]
    VariableTableFull,
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    value: i32,
}

/// Ordered name → i32 store shared between detection and rule evaluation.
/// Names persist until shutdown; values are overwritten, never deleted.
#[derive(Debug, Default)]
pub struct Blackboard {
    vars: Vec<Variable>,
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= VAR_NAME_MAX {
        return name;
    }
    let mut end = VAR_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl Blackboard {
    pub fn new() -> Self {
        Self { vars: Vec::with_capacity(MAX_VARIABLES) }
    }

    /// Replace the value if the name exists (case-sensitive), otherwise
    /// append. Names longer than 31 characters are truncated.
    pub fn set(&mut self, name: &str, value: i32) -> Result<(), BrainError> {
        let name = truncate_name(name);
        if let Some(var) = self.vars.iter_mut().find(|v| v.name == name) {
            var.value = value;
            return Ok(());
        }
        if self.vars.len() >= MAX_VARIABLES {
            return Err(BrainError::VariableTableFull);
        }
        self.vars.push(Variable { name: name.to_string(), value });
        Ok(())
    }

    /// The stored value, or 0 when the name is absent.
    pub fn get(&self, name: &str) -> i32 {
        let name = truncate_name(name);
        self.vars
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Pure transition function of the lifecycle machine. PAUSED and ERROR are
/// sticky; only an explicit [`BrainEngine::set_state`] leaves them.
pub fn next_state(current: GameState, has_results: bool, action_pending: bool) -> GameState {
    match current {
        GameState::Idle if has_results => GameState::Detecting,
        GameState::Detecting if action_pending => GameState::ActionPending,
        GameState::Detecting if !has_results => GameState::Idle,
        GameState::ActionPending => GameState::Executing,
        GameState::Executing => GameState::Detecting,
        _ => current,
    }
}

/// The decision engine. Created once at startup and passed explicitly.
#[derive(Debug, Default)]
pub struct BrainEngine {
    rules: Vec<DecisionRule>,
    blackboard: Blackboard,
    state: GameState,
}

impl BrainEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule table. Rejects an empty or oversized set without
    /// touching the current rules.
    pub fn load_rules(&mut self, rules: Vec<DecisionRule>) -> Result<(), BrainError> {
        if rules.is_empty() || rules.len() > MAX_RULES {
            return Err(BrainError::RuleCountOutOfRange(rules.len()));
        }
        tracing::debug!("loaded {} decision rules", rules.len());
        self.rules = rules;
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    /// Force a state, bypassing the transition table. This is how the
    /// external supervisor pauses, resumes or flags an error.
    pub fn set_state(&mut self, state: GameState) {
        self.state = state;
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn blackboard_mut(&mut self) -> &mut Blackboard {
        &mut self.blackboard
    }

    fn set_or_warn(&mut self, name: &str, value: i32) {
        if self.blackboard.set(name, value).is_err() {
            tracing::warn!("blackboard full, dropping {name}");
        }
    }

    /// Fold found results into the blackboard as `trigger_<id>_x`,
    /// `trigger_<id>_y` and `trigger_<id>_found`, plus the legacy aliases
    /// for trigger ids 1 and 2. A full variable table drops the remaining
    /// names with a warning rather than failing the tick.
    fn ingest_results(&mut self, results: &[VisionResult]) {
        for result in results {
            if !result.found {
                continue;
            }
            let id = result.trigger_id;
            let (x, y) = (result.location.x, result.location.y);
            self.set_or_warn(&format!("trigger_{id}_x"), x);
            self.set_or_warn(&format!("trigger_{id}_y"), y);
            self.set_or_warn(&format!("trigger_{id}_found"), 1);

            // Hard-coded aliases preserved for existing rule files.
            match id {
                1 => {
                    self.set_or_warn("bird_x", x);
                    self.set_or_warn("bird_y", y);
                }
                2 => {
                    self.set_or_warn("gap_center_x", x);
                    self.set_or_warn("gap_center_y", y);
                }
                _ => {}
            }
        }
    }

    /// Priority pass over the rules against the current blackboard: in
    /// insertion order, a rule wins when its priority is strictly greater
    /// than the best so far and its condition holds, so the first match
    /// takes ties.
    pub fn select_action(&self) -> ActionCommand {
        let mut best: Option<&DecisionRule> = None;
        let mut best_priority = -1;

        for rule in &self.rules {
            if rule.priority > best_priority
                && expr::eval_condition(&rule.condition, &self.blackboard)
            {
                best_priority = rule.priority;
                best = Some(rule);
            }
        }

        match best {
            Some(rule) => ActionCommand {
                kind: rule.action,
                start: rule.target,
                end: Point2::new(0, 0),
                duration_ms: ACTION_DURATION_MS,
                hold_ms: 0,
                randomize: ACTION_RANDOMIZE,
            },
            None => ActionCommand::none(),
        }
    }

    /// Update the blackboard from the results, then run the rule pass.
    /// An empty result set short-circuits to a none action without
    /// touching the blackboard.
    pub fn evaluate(&mut self, results: &[VisionResult]) -> ActionCommand {
        if results.is_empty() {
            return ActionCommand::none();
        }
        self.ingest_results(results);
        self.select_action()
    }

    /// One brain tick over the shared header: ingest results, pick an
    /// action, advance the state machine, and publish. The pending action
    /// is written only on the tick that enters ACTION_PENDING;
    /// `result_ready` is raised in every case.
    pub fn process(&mut self, header: &mut Header) {
        let started = Instant::now();

        let count = (header.num_results as usize).min(MAX_RESULTS);
        let results = header.results;

        // Populated slots only: a short result list does not count its
        // unused slots against has_results.
        let has_results = count > 0 && results[..count].iter().all(|r| r.found);

        let action = self.evaluate(&results[..count]);
        let action_pending = action.kind != ActionKind::None;

        let new_state = next_state(self.state, has_results, action_pending);
        if new_state != self.state {
            tracing::debug!("state {} -> {}", self.state, new_state);
            self.state = new_state;
        }

        if action_pending && self.state == GameState::ActionPending {
            header.pending_action = action;
        }

        header.set_state(self.state);
        header.brain_latency_ns = started.elapsed().as_nanos() as i64;
        header.total_latency_ns = header.vision_latency_ns + header.brain_latency_ns;
        header.publish_result();
    }
}
