// src/extras/stable_z_home.rs
// Repeats homing on the Z axis until the resulting stepper position has
// stabilized within tolerance, optionally running a G-code sequence before
// each attempt.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;

use crate::configfile::{ConfigError, Configfile};
use crate::convergence::ConvergenceWindow;
use crate::core_traits::{
    AxisPrerequisiteCheck, HomingAction, Kinematics, PositionReader, PreAttemptAction, ProgressSink, StepperLookup,
};
use crate::gcode::{CommandError, GCode, GCodeCommand};

pub const CONFIG_SECTION: &str = "stable_z_home";
pub const DEFAULT_RETRIES: i64 = 20;
pub const DEFAULT_RETRY_TOLERANCE: f64 = 1.0 / 400.0;
pub const DEFAULT_WINDOW: i64 = 4;
pub const DEFAULT_HOMING_STEPPER: &str = "stepper_z";
const MIN_RETRY_TOLERANCE: f64 = 1.0 / 1000.0;
const MIN_WINDOW: i64 = 3;
// Absorbs rounding in step quantization and float arithmetic.
const TOLERANCE_SLACK: f64 = 1e-4;

const CMD_STABLE_Z_HOME_HELP: &str = "Repeatedly home Z until the Z stepper position stabilizes";

/// Parameters of one stabilization run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizationConfig {
    pub max_retries: u32,
    pub retry_tolerance: f64,
    pub window_size: usize,
}

impl StabilizationConfig {
    pub fn new(max_retries: u32, retry_tolerance: f64, window_size: usize) -> Result<Self, ConfigError> {
        if !(retry_tolerance.is_finite() && retry_tolerance > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "retry_tolerance ({}) must be a positive number", retry_tolerance
            )));
        }
        if window_size < MIN_WINDOW as usize {
            return Err(ConfigError::ValidationError(format!(
                "window ({}) must be >= {}", window_size, MIN_WINDOW
            )));
        }
        Ok(Self { max_retries, retry_tolerance, window_size })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AbortReason {
    #[error("Must home {0} axes first")]
    PrerequisiteNotMet(String),
    #[error("No Z steppers found")]
    NoHomingStepper(String),
    #[error("Pre-home Gcode failed")]
    PreAttemptActionFailed(#[source] CommandError),
    #[error("Homing failed: {0}")]
    HomingActionFailed(CommandError),
}

/// How a stabilization run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Converged { attempt: u32, final_position: f64 },
    /// `attempt` is the number of attempts performed.
    Exhausted { attempt: u32 },
    Aborted { reason: AbortReason },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Converged { .. } => "converged",
            Outcome::Exhausted { .. } => "exhausted",
            Outcome::Aborted { .. } => "aborted",
        }
    }

    /// Final position on success, a command error otherwise.
    pub fn into_result(self) -> Result<f64, CommandError> {
        match self {
            Outcome::Converged { final_position, .. } => Ok(final_position),
            Outcome::Exhausted { .. } => Err(CommandError::GCodeError("Max retries exceeded".to_string())),
            Outcome::Aborted { reason } => Err(CommandError::GCodeError(reason.to_string())),
        }
    }
}

pub struct Collaborators<'a> {
    pub pre_attempt: &'a dyn PreAttemptAction,
    pub homing: &'a dyn HomingAction,
    pub axes: &'a dyn AxisPrerequisiteCheck,
    pub steppers: &'a dyn StepperLookup,
    pub progress: &'a dyn ProgressSink,
}

/// Drives homing attempts until the last `window_size` readings agree or
/// the retry budget runs out.
pub struct StabilizationController<'a> {
    collaborators: Collaborators<'a>,
    homing_stepper: String,
    axis: char,
    required_axes: Vec<char>,
}

impl<'a> StabilizationController<'a> {
    pub fn new(collaborators: Collaborators<'a>, homing_stepper: impl Into<String>) -> Self {
        Self {
            collaborators,
            homing_stepper: homing_stepper.into(),
            axis: 'z',
            required_axes: vec!['x', 'y'],
        }
    }

    /// Axes that must already be homed before the first attempt.
    pub fn with_required_axes(mut self, axes: &[char]) -> Self {
        self.required_axes = axes.iter().map(|a| a.to_ascii_lowercase()).collect();
        self
    }

    fn check_prerequisites(&self) -> Result<Arc<dyn PositionReader>, AbortReason> {
        let homed: HashSet<char> = self.collaborators.axes.homed_axes();
        if self.required_axes.iter().any(|a| !homed.contains(a)) {
            let names: Vec<String> = self.required_axes.iter().map(|a| a.to_ascii_uppercase().to_string()).collect();
            return Err(AbortReason::PrerequisiteNotMet(names.join(" and ")));
        }
        self.collaborators
            .steppers
            .lookup_stepper(&self.homing_stepper)
            .ok_or_else(|| AbortReason::NoHomingStepper(self.homing_stepper.clone()))
    }

    /// Runs to completion. Exactly one outcome per call; each call starts
    /// with an empty window.
    pub fn run(&self, config: &StabilizationConfig) -> Outcome {
        let result = self
            .check_prerequisites()
            .and_then(|stepper| self.attempt_loop(config, stepper.as_ref()));
        let outcome = result.unwrap_or_else(|reason| Outcome::Aborted { reason });
        match &outcome {
            Outcome::Converged { attempt, final_position } => log::info!(
                "Stable Z home: {} converged at {:.4} after {} attempts",
                self.homing_stepper, final_position, attempt
            ),
            Outcome::Exhausted { attempt } => log::warn!(
                "Stable Z home: {} did not stabilize within {} attempts",
                self.homing_stepper, attempt
            ),
            Outcome::Aborted { reason } => log::warn!("Stable Z home aborted: {}", reason),
        }
        outcome
    }

    fn attempt_loop(&self, config: &StabilizationConfig, stepper: &dyn PositionReader) -> Result<Outcome, AbortReason> {
        let mut window = ConvergenceWindow::new(config.window_size);
        let tolerance = config.retry_tolerance + TOLERANCE_SLACK;

        // Counter starts at 1 and is compared with `<=`, so zero retries
        // means zero attempts.
        let mut attempt: u32 = 1;
        while attempt <= config.max_retries {
            self.collaborators.pre_attempt.execute().map_err(|e| {
                log::error!("Exception running pre-home script (attempt {}): {:?}", attempt, e);
                AbortReason::PreAttemptActionFailed(e)
            })?;

            self.collaborators.homing.home(self.axis).map_err(|e| {
                log::error!("Homing {} failed (attempt {}): {}", self.axis, attempt, e);
                AbortReason::HomingActionFailed(e)
            })?;

            let position = stepper.read();
            window.push(position);
            let spread = window.spread();
            log::debug!("Stable Z home attempt {}: position {:.6}, spread {:?}", attempt, position, spread);
            self.collaborators.progress.report(attempt, position, spread);

            if spread.is_some_and(|s| s <= tolerance) {
                return Ok(Outcome::Converged { attempt, final_position: position });
            }
            attempt += 1;
        }
        Ok(Outcome::Exhausted { attempt: attempt - 1 })
    }
}

/// Runs the configured pre-homing script through the G-code dispatcher.
pub struct ScriptAction {
    gcode: Arc<GCode>,
    script: String,
}

impl ScriptAction {
    pub fn new(gcode: Arc<GCode>, script: impl Into<String>) -> Self {
        Self { gcode, script: script.into() }
    }
}

impl PreAttemptAction for ScriptAction {
    fn execute(&self) -> Result<(), CommandError> {
        self.gcode.run_script(&self.script)
    }
}

/// Homes an axis with `G28 <axis>`.
pub struct GCodeHomingAction {
    gcode: Arc<GCode>,
}

impl GCodeHomingAction {
    pub fn new(gcode: Arc<GCode>) -> Self {
        Self { gcode }
    }
}

impl HomingAction for GCodeHomingAction {
    fn home(&self, axis: char) -> Result<(), CommandError> {
        self.gcode.run_script(&format!("G28 {}", axis.to_ascii_uppercase()))
    }
}

/// Writes one response line per attempt.
pub struct GCodeProgress {
    gcode: Arc<GCode>,
    stepper_name: String,
}

impl ProgressSink for GCodeProgress {
    fn report(&self, attempt: u32, position: f64, spread: Option<f64>) {
        let window_range = spread.map_or_else(|| "-".to_string(), |s| format!("{:.4}", s));
        self.gcode.respond_info(&format!(
            "Retry {}: {} position {:.4}, window range {}",
            attempt, self.stepper_name, position, window_range
        ));
    }
}

/// Handles available once the host has connected.
#[derive(Clone)]
pub struct RuntimeHandles {
    pub gcode: Arc<GCode>,
    pub kinematics: Arc<dyn Kinematics>,
}

struct BoundRuntime {
    handles: RuntimeHandles,
    homing_stepper: String,
}

/// The `[stable_z_home]` extra.
pub struct StableZHome {
    before_homing_gcode: String,
    default_max_retries: u32,
    default_retry_tolerance: f64,
    default_window: usize,
    homing_stepper_option: String,
    runtime: Option<BoundRuntime>,
    last_outcome: Option<Outcome>,
}

impl StableZHome {
    pub fn load_config(config: &Configfile) -> Result<Self, ConfigError> {
        let section = CONFIG_SECTION;
        let before_homing_gcode = config.get(section, "gcode", Some(""))?;
        let default_max_retries = config.getint(section, "retries", Some(DEFAULT_RETRIES), Some(0), None)?;
        let default_retry_tolerance =
            config.getfloat_above(section, "retry_tolerance", Some(DEFAULT_RETRY_TOLERANCE), MIN_RETRY_TOLERANCE)?;
        let default_window = config.getint(section, "window", Some(DEFAULT_WINDOW), Some(MIN_WINDOW), None)?;
        let homing_stepper_option = config.get(section, "homing_stepper", Some(DEFAULT_HOMING_STEPPER))?;

        Ok(Self {
            before_homing_gcode,
            default_max_retries: u32::try_from(default_max_retries)
                .map_err(|_| ConfigError::ValidationError(format!("retries ({}) is too large", default_max_retries)))?,
            default_retry_tolerance,
            default_window: usize::try_from(default_window).unwrap_or(usize::MAX),
            homing_stepper_option,
            runtime: None,
            last_outcome: None,
        })
    }

    /// Binds the extra to the running host and resolves the homing stepper.
    pub fn handle_connect(&mut self, handles: RuntimeHandles) -> Result<(), ConfigError> {
        let choices: Vec<String> = handles
            .kinematics
            .get_steppers()
            .iter()
            .map(|s| s.get_name())
            .filter(|name| name.starts_with(DEFAULT_HOMING_STEPPER))
            .collect();
        if !choices.contains(&self.homing_stepper_option) {
            return Err(ConfigError::ValidationError(format!(
                "Choice '{}' for option 'homing_stepper' in section '[{}]' is not a valid choice (expected one of: {})",
                self.homing_stepper_option,
                CONFIG_SECTION,
                choices.join(", ")
            )));
        }
        log::info!("Stable Z home bound to {}", self.homing_stepper_option);
        self.runtime = Some(BoundRuntime {
            handles,
            homing_stepper: self.homing_stepper_option.clone(),
        });
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.runtime.is_some()
    }

    /// Defaults from the config, overridden by any command parameters.
    pub fn stabilization_config(&self, gcmd: &GCodeCommand) -> Result<StabilizationConfig, CommandError> {
        let max_retries = gcmd.get_int("RETRIES", Some(self.default_max_retries.into()), Some(0))?;
        let retry_tolerance =
            gcmd.get_float("RETRY_TOLERANCE", Some(self.default_retry_tolerance), Some(MIN_RETRY_TOLERANCE))?;
        let window = gcmd.get_int("WINDOW", Some(self.default_window as i64), Some(MIN_WINDOW))?;
        let max_retries = u32::try_from(max_retries).map_err(|_| CommandError::BadParameter {
            line: gcmd.raw_line.clone(),
            message: format!("RETRIES ({}) is too large", max_retries),
        })?;
        let window = usize::try_from(window).unwrap_or(usize::MAX);
        StabilizationConfig::new(max_retries, retry_tolerance, window)
            .map_err(|e| CommandError::BadParameter { line: gcmd.raw_line.clone(), message: e.to_string() })
    }

    #[allow(non_snake_case)]
    pub fn cmd_STABLE_Z_HOME(&mut self, gcmd: &GCodeCommand) -> Result<(), CommandError> {
        let config = self.stabilization_config(gcmd)?;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| CommandError::GCodeError("Printer not ready".to_string()))?;
        let gcode = &runtime.handles.gcode;

        gcode.respond_info(&format!(
            "Stable Z home: {:.4} tolerance, window {}, {} max retries",
            config.retry_tolerance, config.window_size, config.max_retries
        ));

        let pre_attempt = ScriptAction::new(Arc::clone(gcode), self.before_homing_gcode.clone());
        let homing = GCodeHomingAction::new(Arc::clone(gcode));
        let progress = GCodeProgress {
            gcode: Arc::clone(gcode),
            stepper_name: runtime.homing_stepper.clone(),
        };
        let kinematics = &runtime.handles.kinematics;
        let controller = StabilizationController::new(
            Collaborators {
                pre_attempt: &pre_attempt,
                homing: &homing,
                axes: kinematics,
                steppers: kinematics,
                progress: &progress,
            },
            runtime.homing_stepper.clone(),
        );

        let outcome = controller.run(&config);
        self.last_outcome = Some(outcome.clone());
        outcome.into_result()?;
        gcode.respond_info("Succeeded");
        Ok(())
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.last_outcome.as_ref()
    }

    pub fn get_status(&self, _eventtime: f64) -> serde_json::Value {
        let state = self.last_outcome.as_ref().map_or("not_started", Outcome::kind);
        let (attempts, position) = match &self.last_outcome {
            Some(Outcome::Converged { attempt, final_position }) => (Some(*attempt), Some(*final_position)),
            Some(Outcome::Exhausted { attempt }) => (Some(*attempt), None),
            _ => (None, None),
        };
        json!({
            "homing_stepper": self.homing_stepper_option,
            "last_result": state,
            "last_attempts": attempts,
            "last_position": position,
        })
    }

    /// Registers `STABLE_Z_HOME`. The dispatcher only keeps a weak reference.
    ///
    /// A nested `STABLE_Z_HOME` (from the pre-homing script) fails instead of
    /// waiting on the run that is already holding the extra.
    pub fn register_commands(this: &Arc<Mutex<StableZHome>>, gcode: &GCode) {
        let weak: Weak<Mutex<StableZHome>> = Arc::downgrade(this);
        gcode.register_command(
            "STABLE_Z_HOME",
            move |gcmd| {
                let extra = weak
                    .upgrade()
                    .ok_or_else(|| CommandError::GCodeError("stable_z_home object dropped".to_string()))?;
                let mut extra = extra
                    .try_lock()
                    .ok_or_else(|| CommandError::GCodeError("STABLE_Z_HOME already running".to_string()))?;
                extra.cmd_STABLE_Z_HOME(gcmd)
            },
            Some(CMD_STABLE_Z_HOME_HELP),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    type EventLog = Rc<RefCell<Vec<String>>>;

    struct MockStepper {
        name: String,
        value: Cell<f64>,
        // Commanded-frame shift applied by each homing move; must cancel out in `read`.
        frame_shift: Cell<f64>,
        reads: Cell<u32>,
    }

    impl PositionReader for MockStepper {
        fn get_name(&self) -> String {
            self.name.clone()
        }
        fn get_commanded_position(&self) -> f64 {
            self.reads.set(self.reads.get() + 1);
            self.value.get() + self.frame_shift.get()
        }
        fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64 {
            mcu_pos as f64 * 0.0025 + self.frame_shift.get()
        }
    }

    struct MockPreAttempt {
        fail_on: Option<u32>,
        calls: Cell<u32>,
        events: EventLog,
    }

    impl PreAttemptAction for MockPreAttempt {
        fn execute(&self) -> Result<(), CommandError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            self.events.borrow_mut().push(format!("pre {}", call));
            if self.fail_on == Some(call) {
                return Err(CommandError::UnknownCommand("BAD_MACRO".to_string()));
            }
            Ok(())
        }
    }

    struct MockHoming {
        stepper: Arc<MockStepper>,
        readings: RefCell<VecDeque<f64>>,
        fail_on: Option<u32>,
        calls: Cell<u32>,
        events: EventLog,
    }

    impl HomingAction for MockHoming {
        fn home(&self, axis: char) -> Result<(), CommandError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            self.events.borrow_mut().push(format!("home {} {}", axis, call));
            if self.fail_on == Some(call) {
                return Err(CommandError::GCodeError("Endstop still triggered after retract".to_string()));
            }
            let next = self.readings.borrow_mut().pop_front().unwrap_or(0.0);
            self.stepper.value.set(next);
            self.stepper.frame_shift.set(call as f64 * 3.7);
            Ok(())
        }
    }

    struct MockKinematics {
        homed: HashSet<char>,
        steppers: Vec<Arc<MockStepper>>,
    }

    impl AxisPrerequisiteCheck for MockKinematics {
        fn homed_axes(&self) -> HashSet<char> {
            self.homed.clone()
        }
    }

    impl StepperLookup for MockKinematics {
        fn get_steppers(&self) -> Vec<Arc<dyn PositionReader>> {
            self.steppers.iter().map(|s| Arc::clone(s) as Arc<dyn PositionReader>).collect()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        reports: RefCell<Vec<(u32, f64, Option<f64>)>>,
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, attempt: u32, position: f64, spread: Option<f64>) {
            self.reports.borrow_mut().push((attempt, position, spread));
        }
    }

    struct Harness {
        stepper: Arc<MockStepper>,
        pre: MockPreAttempt,
        homing: MockHoming,
        kin: MockKinematics,
        sink: RecordingSink,
        events: EventLog,
    }

    impl Harness {
        fn new(readings: &[f64]) -> Self {
            let events: EventLog = Rc::new(RefCell::new(Vec::new()));
            let stepper = Arc::new(MockStepper {
                name: "stepper_z".to_string(),
                value: Cell::new(0.0),
                frame_shift: Cell::new(0.0),
                reads: Cell::new(0),
            });
            Harness {
                pre: MockPreAttempt { fail_on: None, calls: Cell::new(0), events: Rc::clone(&events) },
                homing: MockHoming {
                    stepper: Arc::clone(&stepper),
                    readings: RefCell::new(readings.iter().copied().collect()),
                    fail_on: None,
                    calls: Cell::new(0),
                    events: Rc::clone(&events),
                },
                kin: MockKinematics {
                    homed: ['x', 'y'].into_iter().collect(),
                    steppers: vec![Arc::clone(&stepper)],
                },
                sink: RecordingSink::default(),
                stepper,
                events,
            }
        }

        fn run(&self, max_retries: u32, tolerance: f64, window: usize) -> Outcome {
            let controller = StabilizationController::new(
                Collaborators {
                    pre_attempt: &self.pre,
                    homing: &self.homing,
                    axes: &self.kin,
                    steppers: &self.kin,
                    progress: &self.sink,
                },
                "stepper_z",
            );
            controller.run(&StabilizationConfig::new(max_retries, tolerance, window).unwrap())
        }
    }

    #[test]
    fn converges_once_last_window_is_within_tolerance() {
        let h = Harness::new(&[0.10, 0.101, 0.102, 0.099]);
        match h.run(20, 0.01, 3) {
            Outcome::Converged { attempt, final_position } => {
                assert_eq!(attempt, 4);
                assert!((final_position - 0.099).abs() < 1e-9);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
        assert_eq!(h.homing.calls.get(), 4);
    }

    #[test]
    fn keeps_going_while_window_spread_is_too_wide() {
        let h = Harness::new(&[0.50, 0.03, 0.02, 0.01]);
        assert_eq!(h.run(4, 0.01, 3), Outcome::Exhausted { attempt: 4 });
        let reports = h.sink.reports.borrow();
        let (_, _, last_spread) = reports[3];
        assert!((last_spread.unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn exhausts_after_exactly_max_retries_attempts() {
        let h = Harness::new(&[0.0, 1.0, 0.0, 1.0, 0.0]);
        assert_eq!(h.run(2, 0.01, 3), Outcome::Exhausted { attempt: 2 });
        assert_eq!(h.pre.calls.get(), 2);
        assert_eq!(h.homing.calls.get(), 2);
        assert_eq!(h.sink.reports.borrow().len(), 2);
    }

    #[test]
    fn zero_retries_performs_no_attempts() {
        let h = Harness::new(&[0.0, 0.0, 0.0]);
        assert_eq!(h.run(0, 0.01, 3), Outcome::Exhausted { attempt: 0 });
        assert_eq!(h.pre.calls.get(), 0);
        assert_eq!(h.homing.calls.get(), 0);
        assert!(h.sink.reports.borrow().is_empty());
    }

    #[test]
    fn spread_reported_only_once_window_is_full() {
        let h = Harness::new(&[0.3, 0.2, 0.1, 0.1]);
        let _ = h.run(4, 0.01, 3);
        let spreads: Vec<Option<f64>> = h.sink.reports.borrow().iter().map(|r| r.2).collect();
        assert_eq!(spreads[0], None);
        assert_eq!(spreads[1], None);
        assert!(spreads[2].is_some());
        let attempts: Vec<u32> = h.sink.reports.borrow().iter().map(|r| r.0).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
    }

    #[test]
    fn tolerance_includes_fixed_slack() {
        let h = Harness::new(&[0.0, 0.01005, 0.0]);
        assert_eq!(h.run(3, 0.01, 3).kind(), "converged");

        let h = Harness::new(&[0.0, 0.0102, 0.0]);
        assert_eq!(h.run(3, 0.01, 3), Outcome::Exhausted { attempt: 3 });
    }

    #[test]
    fn shared_frame_shift_cancels_out() {
        // Every homing move re-bases the commanded frame by a different amount.
        let h = Harness::new(&[1.25, 1.25, 1.25]);
        match h.run(5, 0.01, 3) {
            Outcome::Converged { attempt, final_position } => {
                assert_eq!(attempt, 3);
                assert!((final_position - 1.25).abs() < 1e-9);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
    }

    #[test]
    fn pre_attempt_failure_aborts_before_homing() {
        let mut h = Harness::new(&[0.0, 0.0, 0.0]);
        h.pre.fail_on = Some(2);
        match h.run(10, 0.01, 3) {
            Outcome::Aborted { reason: AbortReason::PreAttemptActionFailed(_) } => {}
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(h.homing.calls.get(), 1);
        assert_eq!(*h.events.borrow(), vec!["pre 1", "home z 1", "pre 2"]);
    }

    #[test]
    fn homing_failure_aborts_without_reading() {
        let mut h = Harness::new(&[0.5, 0.4, 0.3]);
        h.homing.fail_on = Some(3);
        match h.run(10, 0.01, 3) {
            Outcome::Aborted { reason: AbortReason::HomingActionFailed(_) } => {}
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(h.stepper.reads.get(), 2);
        assert_eq!(h.sink.reports.borrow().len(), 2);
        assert_eq!(h.pre.calls.get(), 3);
    }

    #[test]
    fn unhomed_prerequisite_axes_abort_before_any_attempt() {
        let mut h = Harness::new(&[0.0, 0.0, 0.0]);
        h.kin.homed = ['x'].into_iter().collect();
        let outcome = h.run(10, 0.01, 3);
        assert_eq!(
            outcome,
            Outcome::Aborted { reason: AbortReason::PrerequisiteNotMet("X and Y".to_string()) }
        );
        assert_eq!(outcome.into_result().unwrap_err().to_string(), "Must home X and Y axes first");
        assert_eq!(h.pre.calls.get(), 0);
    }

    #[test]
    fn missing_homing_stepper_aborts() {
        let mut h = Harness::new(&[0.0, 0.0, 0.0]);
        h.kin.steppers.clear();
        let outcome = h.run(10, 0.01, 3);
        assert_eq!(outcome.clone().into_result().unwrap_err().to_string(), "No Z steppers found");
        assert_eq!(h.homing.calls.get(), 0);
    }

    #[test]
    fn each_run_starts_with_an_empty_window() {
        let h = Harness::new(&[0.2, 0.2, 0.2, 0.2, 0.2, 0.2]);
        assert_eq!(h.run(10, 0.01, 3).kind(), "converged");
        // Second run needs three fresh readings of its own.
        match h.run(10, 0.01, 3) {
            Outcome::Converged { attempt, .. } => assert_eq!(attempt, 3),
            other => panic!("expected convergence, got {:?}", other),
        }
        assert_eq!(h.homing.calls.get(), 6);
    }

    #[test]
    fn config_rejects_small_window_and_bad_tolerance() {
        assert!(StabilizationConfig::new(5, 0.01, 2).is_err());
        assert!(StabilizationConfig::new(5, 0.0, 3).is_err());
        assert!(StabilizationConfig::new(5, f64::NAN, 3).is_err());
        assert!(StabilizationConfig::new(0, 0.01, 3).is_ok());
    }

    #[test]
    fn exhausted_maps_to_max_retries_error() {
        let err = Outcome::Exhausted { attempt: 3 }.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Max retries exceeded");
        let err = Outcome::Aborted {
            reason: AbortReason::PreAttemptActionFailed(CommandError::UnknownCommand("X".to_string())),
        }
        .into_result()
        .unwrap_err();
        assert_eq!(err.to_string(), "Pre-home Gcode failed");
    }

    // --- Extra-level tests ---

    struct NamedStepper(String);

    impl PositionReader for NamedStepper {
        fn get_name(&self) -> String {
            self.0.clone()
        }
        fn get_commanded_position(&self) -> f64 {
            0.0
        }
        fn mcu_to_commanded_position(&self, _mcu_pos: i64) -> f64 {
            0.0
        }
    }

    struct FixedKinematics(Vec<&'static str>);

    impl AxisPrerequisiteCheck for FixedKinematics {
        fn homed_axes(&self) -> HashSet<char> {
            HashSet::new()
        }
    }

    impl StepperLookup for FixedKinematics {
        fn get_steppers(&self) -> Vec<Arc<dyn PositionReader>> {
            self.0
                .iter()
                .map(|n| Arc::new(NamedStepper(n.to_string())) as Arc<dyn PositionReader>)
                .collect()
        }
    }

    fn runtime(steppers: Vec<&'static str>) -> RuntimeHandles {
        RuntimeHandles { gcode: Arc::new(GCode::new()), kinematics: Arc::new(FixedKinematics(steppers)) }
    }

    fn config_from(content: &str) -> Configfile {
        let mut cf = Configfile::new(None);
        cf.parse(content).unwrap();
        cf
    }

    #[test]
    fn load_config_defaults() {
        let extra = StableZHome::load_config(&config_from("[stable_z_home]\n")).unwrap();
        assert_eq!(extra.default_max_retries, 20);
        assert_eq!(extra.default_retry_tolerance, 0.0025);
        assert_eq!(extra.default_window, 4);
        assert_eq!(extra.homing_stepper_option, "stepper_z");
        assert!(extra.before_homing_gcode.is_empty());
        assert!(!extra.is_ready());
    }

    #[test]
    fn load_config_validates_options() {
        assert!(StableZHome::load_config(&config_from("[stable_z_home]\nwindow: 2\n")).is_err());
        assert!(StableZHome::load_config(&config_from("[stable_z_home]\nretries: -1\n")).is_err());
        assert!(StableZHome::load_config(&config_from("[stable_z_home]\nretry_tolerance: 0.001\n")).is_err());
        assert!(StableZHome::load_config(&config_from("[stable_z_home]\nretry_tolerance: 0.0011\n")).is_ok());
    }

    #[test]
    fn command_overrides_config_defaults() {
        let extra = StableZHome::load_config(&config_from("[stable_z_home]\nretries: 8\nwindow: 5\n")).unwrap();
        let gcmd = crate::gcode::parse_line("STABLE_Z_HOME RETRY_TOLERANCE=0.01").unwrap().unwrap();
        assert_eq!(
            extra.stabilization_config(&gcmd).unwrap(),
            StabilizationConfig { max_retries: 8, retry_tolerance: 0.01, window_size: 5 }
        );
        let gcmd = crate::gcode::parse_line("STABLE_Z_HOME WINDOW=2").unwrap().unwrap();
        assert!(extra.stabilization_config(&gcmd).is_err());
        let gcmd = crate::gcode::parse_line("STABLE_Z_HOME RETRY_TOLERANCE=0.0005").unwrap().unwrap();
        assert!(extra.stabilization_config(&gcmd).is_err());
    }

    #[test]
    fn command_refuses_to_run_before_connect() {
        let mut extra = StableZHome::load_config(&config_from("[stable_z_home]\n")).unwrap();
        let gcmd = crate::gcode::parse_line("STABLE_Z_HOME").unwrap().unwrap();
        assert_eq!(
            extra.cmd_STABLE_Z_HOME(&gcmd),
            Err(CommandError::GCodeError("Printer not ready".to_string()))
        );
        assert!(extra.last_outcome().is_none());
    }

    #[test]
    fn connect_validates_homing_stepper_choice() {
        let mut extra =
            StableZHome::load_config(&config_from("[stable_z_home]\nhoming_stepper: stepper_z1\n")).unwrap();
        assert!(extra.handle_connect(runtime(vec!["stepper_x", "stepper_z"])).is_err());
        assert!(!extra.is_ready());
        assert!(extra.handle_connect(runtime(vec!["stepper_x", "stepper_z", "stepper_z1"])).is_ok());
        assert!(extra.is_ready());
    }

    #[test]
    fn connect_only_offers_z_steppers() {
        let mut extra =
            StableZHome::load_config(&config_from("[stable_z_home]\nhoming_stepper: stepper_x\n")).unwrap();
        assert!(extra.handle_connect(runtime(vec!["stepper_x", "stepper_z"])).is_err());
    }

    #[test]
    fn status_before_any_run() {
        let extra = StableZHome::load_config(&config_from("[stable_z_home]\n")).unwrap();
        let status = extra.get_status(0.0);
        assert_eq!(status["last_result"], "not_started");
        assert!(status["last_position"].is_null());
    }
}
