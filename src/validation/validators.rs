use tokio::time::{Duration, Instant};

use super::{ValidationResult, ValidationThresholds, Validator};
use crate::telemetry::TelemetrySample;

/// Pack and cell voltages against absolute limits.
pub struct VoltageRangeValidator {
    pack_min_v: f32,
    pack_max_v: f32,
    pack_low_warning_v: f32,
    cell_min_v: f32,
    cell_max_v: f32,
    cell_low_warning_v: f32,
}

impl VoltageRangeValidator {
    pub fn new(t: &ValidationThresholds) -> Self {
        Self {
            pack_min_v: t.pack_min_v,
            pack_max_v: t.pack_max_v,
            pack_low_warning_v: t.pack_low_warning_v,
            cell_min_v: t.cell_min_v,
            cell_max_v: t.cell_max_v,
            cell_low_warning_v: t.cell_low_warning_v,
        }
    }
}

impl Validator for VoltageRangeValidator {
    fn name(&self) -> &'static str {
        "voltage_range"
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Some(pack) = sample.pack_voltage_v {
            if !(self.pack_min_v..=self.pack_max_v).contains(&pack) {
                errors.push(format!(
                    "pack voltage {pack:.2}V outside {:.2}V..{:.2}V",
                    self.pack_min_v, self.pack_max_v
                ));
            } else if pack < self.pack_low_warning_v {
                warnings.push(format!("pack voltage {pack:.2}V is low"));
            }
        }

        for (i, &cell) in sample.cell_voltages_v.iter().enumerate() {
            if !(self.cell_min_v..=self.cell_max_v).contains(&cell) {
                errors.push(format!(
                    "cell {} voltage {cell:.3}V outside {:.3}V..{:.3}V",
                    i + 1,
                    self.cell_min_v,
                    self.cell_max_v
                ));
            } else if cell < self.cell_low_warning_v {
                warnings.push(format!("cell {} voltage {cell:.3}V is low", i + 1));
            }
        }

        verdict(errors, warnings)
    }
}

/// Current against sensor plausibility and recommended limits.
pub struct CurrentRangeValidator {
    sensor_error_a: f32,
    max_charge_a: f32,
    max_discharge_a: f32,
}

impl CurrentRangeValidator {
    pub fn new(t: &ValidationThresholds) -> Self {
        Self {
            sensor_error_a: t.current_sensor_error_a,
            max_charge_a: t.max_charge_current_a,
            max_discharge_a: t.max_discharge_current_a,
        }
    }
}

impl Validator for CurrentRangeValidator {
    fn name(&self) -> &'static str {
        "current_range"
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult {
        let Some(current) = sample.current_a else {
            return ValidationResult::Valid;
        };

        if current.abs() > self.sensor_error_a {
            ValidationResult::Error(format!(
                "current {current:.2}A is beyond {:.0}A, likely a sensor fault",
                self.sensor_error_a
            ))
        } else if current > self.max_charge_a {
            ValidationResult::Warning(format!(
                "charge current {current:.2}A above recommended {:.0}A",
                self.max_charge_a
            ))
        } else if -current > self.max_discharge_a {
            ValidationResult::Warning(format!(
                "discharge current {:.2}A above recommended {:.0}A",
                -current, self.max_discharge_a
            ))
        } else {
            ValidationResult::Valid
        }
    }
}

/// Sensor temperatures against operating limits. Physically impossible readings are
/// treated as noise and ignored.
pub struct TemperatureRangeValidator {
    plausible_min_c: f32,
    plausible_max_c: f32,
    min_c: f32,
    max_c: f32,
    margin_c: f32,
}

impl TemperatureRangeValidator {
    pub fn new(t: &ValidationThresholds) -> Self {
        Self {
            plausible_min_c: t.temperature_plausible_min_c,
            plausible_max_c: t.temperature_plausible_max_c,
            min_c: t.temperature_min_c,
            max_c: t.temperature_max_c,
            margin_c: t.temperature_warning_margin_c,
        }
    }
}

impl Validator for TemperatureRangeValidator {
    fn name(&self) -> &'static str {
        "temperature_range"
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut noise = 0;

        for (i, &t) in sample.temperatures_c.iter().enumerate() {
            let sensor = i + 1;
            if !(self.plausible_min_c..=self.plausible_max_c).contains(&t) {
                noise += 1;
            } else if t < self.min_c || t > self.max_c {
                errors.push(format!(
                    "sensor {sensor} at {t:.1}°C outside {:.1}°C..{:.1}°C",
                    self.min_c, self.max_c
                ));
            } else if t < self.min_c + self.margin_c || t > self.max_c - self.margin_c {
                warnings.push(format!("sensor {sensor} at {t:.1}°C is near its limit"));
            }
        }

        match verdict(errors, warnings) {
            ValidationResult::Valid if noise > 0 => {
                ValidationResult::Skipped(format!("ignored {noise} implausible temperature readings"))
            }
            other => other,
        }
    }
}

pub struct StateOfChargeValidator {
    low_warning_pct: f32,
    high_warning_pct: f32,
}

impl StateOfChargeValidator {
    pub fn new(t: &ValidationThresholds) -> Self {
        Self {
            low_warning_pct: t.soc_low_warning_pct,
            high_warning_pct: t.soc_high_warning_pct,
        }
    }
}

impl Validator for StateOfChargeValidator {
    fn name(&self) -> &'static str {
        "state_of_charge"
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult {
        match sample.state_of_charge_pct {
            None => ValidationResult::Valid,
            Some(soc) if !(0.0..=100.0).contains(&soc) => {
                ValidationResult::Error(format!("state of charge {soc:.0}% outside 0%..100%"))
            }
            Some(soc) if soc < self.low_warning_pct => {
                ValidationResult::Warning(format!("state of charge {soc:.0}% is very low"))
            }
            Some(soc) if soc > self.high_warning_pct => {
                ValidationResult::Warning(format!("state of charge {soc:.0}% is very high"))
            }
            Some(_) => ValidationResult::Valid,
        }
    }
}

/// Spread between the highest and lowest cell.
pub struct CellBalanceValidator {
    warning_v: f32,
    error_v: f32,
}

impl CellBalanceValidator {
    pub fn new(t: &ValidationThresholds) -> Self {
        Self {
            warning_v: t.imbalance_warning_v,
            error_v: t.imbalance_error_v,
        }
    }
}

impl Validator for CellBalanceValidator {
    fn name(&self) -> &'static str {
        "cell_balance"
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult {
        if sample.cell_voltages_v.is_empty() {
            return ValidationResult::Valid;
        }
        let Some(imbalance) = sample.cell_imbalance_v() else {
            return ValidationResult::Skipped("balance needs at least two cells".to_string());
        };

        let mv = imbalance * 1000.0;
        if imbalance > self.error_v {
            ValidationResult::Error(format!(
                "cell imbalance {mv:.0}mV exceeds {:.0}mV",
                self.error_v * 1000.0
            ))
        } else if imbalance > self.warning_v {
            ValidationResult::Warning(format!(
                "cell imbalance {mv:.0}mV exceeds {:.0}mV",
                self.warning_v * 1000.0
            ))
        } else {
            ValidationResult::Valid
        }
    }
}

struct Snapshot {
    taken_at: Instant,
    pack_voltage_v: Option<f32>,
    state_of_charge_pct: Option<f32>,
}

/// Rate of change against the previous sample. Only warns: a jump may be a real event.
pub struct ConsistencyValidator {
    window: Duration,
    max_voltage_rate: f32,
    max_soc_rate: f32,
    last: Option<Snapshot>,
}

impl ConsistencyValidator {
    pub fn new(t: &ValidationThresholds) -> Self {
        Self {
            window: t.consistency_window,
            max_voltage_rate: t.max_voltage_rate_v_per_s,
            max_soc_rate: t.max_soc_rate_pct_per_s,
            last: None,
        }
    }

    fn compare(&self, last: &Snapshot, sample: &TelemetrySample) -> ValidationResult {
        let Some(elapsed) = sample.taken_at.checked_duration_since(last.taken_at) else {
            return ValidationResult::Valid;
        };
        if elapsed.is_zero() || elapsed > self.window {
            return ValidationResult::Valid;
        }
        let secs = elapsed.as_secs_f32();

        let mut warnings = Vec::new();
        if let (Some(before), Some(now)) = (last.pack_voltage_v, sample.pack_voltage_v) {
            let rate = (now - before).abs() / secs;
            if rate > self.max_voltage_rate {
                warnings.push(format!(
                    "pack voltage moved {before:.2}V -> {now:.2}V in {secs:.1}s"
                ));
            }
        }
        if let (Some(before), Some(now)) = (last.state_of_charge_pct, sample.state_of_charge_pct) {
            let rate = (now - before).abs() / secs;
            if rate > self.max_soc_rate {
                warnings.push(format!(
                    "state of charge moved {before:.0}% -> {now:.0}% in {secs:.1}s"
                ));
            }
        }
        verdict(Vec::new(), warnings)
    }
}

impl Validator for ConsistencyValidator {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn is_safety_critical(&self) -> bool {
        false
    }

    fn validate(&mut self, sample: &TelemetrySample) -> ValidationResult {
        let result = match &self.last {
            Some(last) => self.compare(last, sample),
            None => ValidationResult::Valid,
        };
        self.last = Some(Snapshot {
            taken_at: sample.taken_at,
            pack_voltage_v: sample.pack_voltage_v,
            state_of_charge_pct: sample.state_of_charge_pct,
        });
        result
    }
}

fn verdict(errors: Vec<String>, warnings: Vec<String>) -> ValidationResult {
    if !errors.is_empty() {
        ValidationResult::Error(errors.join("; "))
    } else if !warnings.is_empty() {
        ValidationResult::Warning(warnings.join("; "))
    } else {
        ValidationResult::Valid
    }
}
