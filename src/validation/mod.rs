//! Sanity checks run on every telemetry sample before it reaches a consumer.
//!
//! Each validator looks at one aspect of a sample and returns a single verdict. The
//! pipeline runs them in order and turns every verdict other than `Valid` into a
//! [`ValidationFinding`].

mod validators;

pub use validators::{
    CellBalanceValidator, ConsistencyValidator, CurrentRangeValidator, StateOfChargeValidator,
    TemperatureRangeValidator, VoltageRangeValidator,
};

use tokio::time::{Duration, Instant};

use crate::telemetry::TelemetrySample;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// The check did not apply, e.g. the sensor value was noise
    Skipped(String),
    Warning(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub message: String,
    pub validator_name: &'static str,
    pub timestamp: Instant,
}

pub trait Validator: Send {
    fn name(&self) -> &'static str;

    /// Whether an `Error` from this validator means the sample must not be acted on.
    fn is_safety_critical(&self) -> bool {
        true
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult;
}

/// Limits the validators check against.
///
/// The defaults suit a 4 to 8 cell LiFePO4 pack.
#[derive(Debug, Clone)]
pub struct ValidationThresholds {
    pub pack_min_v: f32,
    pub pack_max_v: f32,
    /// Warn below this pack voltage
    pub pack_low_warning_v: f32,
    pub cell_min_v: f32,
    pub cell_max_v: f32,
    /// Warn below this cell voltage
    pub cell_low_warning_v: f32,

    /// Any current beyond this magnitude is a sensor fault
    pub current_sensor_error_a: f32,
    pub max_charge_current_a: f32,
    pub max_discharge_current_a: f32,

    /// Readings outside this band are sensor noise and are not checked
    pub temperature_plausible_min_c: f32,
    pub temperature_plausible_max_c: f32,
    pub temperature_min_c: f32,
    pub temperature_max_c: f32,
    /// Warn within this distance of the operating limits
    pub temperature_warning_margin_c: f32,

    pub soc_low_warning_pct: f32,
    pub soc_high_warning_pct: f32,

    pub imbalance_warning_v: f32,
    pub imbalance_error_v: f32,

    /// Samples further apart than this are not compared
    pub consistency_window: Duration,
    pub max_voltage_rate_v_per_s: f32,
    pub max_soc_rate_pct_per_s: f32,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            pack_min_v: 8.0,
            pack_max_v: 30.0,
            pack_low_warning_v: 10.0,
            cell_min_v: 2.5,
            cell_max_v: 3.65,
            cell_low_warning_v: 2.8,

            current_sensor_error_a: 500.0,
            max_charge_current_a: 100.0,
            max_discharge_current_a: 150.0,

            temperature_plausible_min_c: -40.0,
            temperature_plausible_max_c: 125.0,
            temperature_min_c: -20.0,
            temperature_max_c: 60.0,
            temperature_warning_margin_c: 5.0,

            soc_low_warning_pct: 10.0,
            soc_high_warning_pct: 98.0,

            imbalance_warning_v: 0.050,
            imbalance_error_v: 0.100,

            consistency_window: Duration::from_secs(10),
            max_voltage_rate_v_per_s: 2.0,
            max_soc_rate_pct_per_s: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Run every validator and collect every finding
    #[default]
    Full,
    /// Stop at the first error from a safety-critical validator
    Fast,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    pub findings: Vec<ValidationFinding>,
    /// A safety-critical validator reported an error
    pub rejected: bool,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }
}

pub struct ValidationPipeline {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    pub fn empty() -> Self {
        Self { validators: Vec::new() }
    }

    /// Every built-in validator, consistency last.
    pub fn new(thresholds: &ValidationThresholds) -> Self {
        Self::empty()
            .with(VoltageRangeValidator::new(thresholds))
            .with(CurrentRangeValidator::new(thresholds))
            .with(TemperatureRangeValidator::new(thresholds))
            .with(StateOfChargeValidator::new(thresholds))
            .with(CellBalanceValidator::new(thresholds))
            .with(ConsistencyValidator::new(thresholds))
    }

    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn run(&mut self, sample: &TelemetrySample, mode: ValidationMode) -> ValidationReport {
        match mode {
            ValidationMode::Full => self.run_full(sample),
            ValidationMode::Fast => self.run_fast(sample),
        }
    }

    /// Run every validator.
    pub fn run_full(&mut self, sample: &TelemetrySample) -> ValidationReport {
        self.run_until(sample, false)
    }

    /// Run validators until a safety-critical one reports an error.
    pub fn run_fast(&mut self, sample: &TelemetrySample) -> ValidationReport {
        self.run_until(sample, true)
    }

    fn run_until(&mut self, sample: &TelemetrySample, stop_on_error: bool) -> ValidationReport {
        let mut report = ValidationReport::default();
        for validator in self.validators.iter_mut() {
            let (severity, message) = match validator.validate(sample) {
                ValidationResult::Valid => continue,
                ValidationResult::Skipped(message) => (Severity::Info, message),
                ValidationResult::Warning(message) => (Severity::Warning, message),
                ValidationResult::Error(message) => (Severity::Error, message),
            };

            let critical = severity == Severity::Error && validator.is_safety_critical();
            if severity >= Severity::Warning {
                log::warn!("{}: {message}", validator.name());
            }
            report.findings.push(ValidationFinding {
                severity,
                message,
                validator_name: validator.name(),
                timestamp: Instant::now(),
            });

            if critical {
                report.rejected = true;
                if stop_on_error {
                    break;
                }
            }
        }
        report
    }
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::new(&ValidationThresholds::default())
    }
}
