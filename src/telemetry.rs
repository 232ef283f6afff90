use tokio::time::Instant;

use crate::message::{BasicInfoMessage, CellVoltagesMessage};

/// One decoded reading of the battery.
///
/// Built from whichever replies were available; anything the replies did not carry is
/// `None` or empty and is skipped by validation.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    /// The pack voltage in V
    pub pack_voltage_v: Option<f32>,
    /// The current in A, positive when charging
    pub current_a: Option<f32>,
    /// The state of charge in %
    pub state_of_charge_pct: Option<f32>,
    /// The residual capacity in Ah
    pub residual_capacity_ah: Option<f32>,
    /// The nominal capacity in Ah
    pub nominal_capacity_ah: Option<f32>,
    /// Lifetime number of battery cycles
    pub cycles_count: Option<u16>,
    /// The voltage of each cell in V
    pub cell_voltages_v: Vec<f32>,
    /// Sensor temperatures in °C
    pub temperatures_c: Vec<f32>,
    pub protection_status: Option<u16>,
    pub taken_at: Instant,
}

impl TelemetrySample {
    /// A sample with nothing in it, taken now.
    pub fn empty() -> Self {
        Self {
            pack_voltage_v: None,
            current_a: None,
            state_of_charge_pct: None,
            residual_capacity_ah: None,
            nominal_capacity_ah: None,
            cycles_count: None,
            cell_voltages_v: Vec::new(),
            temperatures_c: Vec::new(),
            protection_status: None,
            taken_at: Instant::now(),
        }
    }

    pub fn from_basic_info(info: &BasicInfoMessage) -> Self {
        Self {
            pack_voltage_v: info.pack_voltage_v(),
            current_a: info.current_a(),
            state_of_charge_pct: info.state_of_charge_pct().map(f32::from),
            residual_capacity_ah: info.residual_capacity_cah().map(|cah| cah as f32 / 100.0),
            nominal_capacity_ah: info.nominal_capacity_cah().map(|cah| cah as f32 / 100.0),
            cycles_count: info.cycles_count(),
            temperatures_c: info.temperatures_c(),
            protection_status: info.protection_status(),
            ..Self::empty()
        }
    }

    pub fn with_cells(mut self, cells: &CellVoltagesMessage) -> Self {
        self.cell_voltages_v = cells.cell_voltage_v();
        self
    }

    /// Highest minus lowest cell voltage in V, if there are at least two cells
    pub fn cell_imbalance_v(&self) -> Option<f32> {
        if self.cell_voltages_v.len() < 2 {
            return None;
        }
        let max = self.cell_voltages_v.iter().copied().fold(f32::MIN, f32::max);
        let min = self.cell_voltages_v.iter().copied().fold(f32::MAX, f32::min);
        Some(max - min)
    }
}

#[test]
fn test_sample_from_messages() {
    let info = BasicInfoMessage::new(
        hex::decode("0530ff6a1f402710000c2eb100000000000010500304020ba50bb4").unwrap(),
    )
    .unwrap();
    let cells = CellVoltagesMessage::new(hex::decode("0ce40ce50cdf0ce6").unwrap()).unwrap();
    let sample = TelemetrySample::from_basic_info(&info).with_cells(&cells);

    assert_eq!(sample.pack_voltage_v, Some(13.28));
    assert_eq!(sample.current_a, Some(-1.5));
    assert_eq!(sample.state_of_charge_pct, Some(80.0));
    assert_eq!(sample.residual_capacity_ah, Some(80.0));
    assert_eq!(sample.cell_voltages_v.len(), 4);
    assert_eq!(sample.temperatures_c, vec![25.0, 26.5]);
    let imbalance = sample.cell_imbalance_v().unwrap();
    assert!((imbalance - 0.007).abs() < 1e-4);
}
