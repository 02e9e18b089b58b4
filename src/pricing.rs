use crate::model::VehicleClass;

/// Computes the amount charged for a booking. Must be pure: the engine calls it
/// while holding a slot lock and stores the result on the booking.
pub trait PricingPolicy: Send + Sync {
    fn amount(&self, class: VehicleClass, duration_hours: u32) -> u64;
}

/// Flat per-hour rate for each vehicle class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyRates {
    pub two_wheeler: u64,
    pub four_wheeler: u64,
    pub bus: u64,
}

impl HourlyRates {
    pub fn flat(rate: u64) -> Self {
        Self {
            two_wheeler: rate,
            four_wheeler: rate,
            bus: rate,
        }
    }

    pub fn rate(&self, class: VehicleClass) -> u64 {
        match class {
            VehicleClass::TwoWheeler => self.two_wheeler,
            VehicleClass::FourWheeler => self.four_wheeler,
            VehicleClass::Bus => self.bus,
        }
    }
}

impl Default for HourlyRates {
    fn default() -> Self {
        Self::flat(20)
    }
}

impl PricingPolicy for HourlyRates {
    fn amount(&self, class: VehicleClass, duration_hours: u32) -> u64 {
        self.rate(class).saturating_mul(u64::from(duration_hours))
    }
}
