//! Built-in campus parking layout, seeded into an empty store at startup.

use ulid::Ulid;

use crate::engine::SlotSpec;
use crate::model::*;

/// Slot counts per vehicle class at each campus location.
pub const CAMPUS_CAPACITY: &[(Location, &[(VehicleClass, u32)])] = &[
    (Location::GirlsHostel, &[(VehicleClass::Bus, 50)]),
    (
        Location::EighthBlock,
        &[(VehicleClass::TwoWheeler, 30), (VehicleClass::FourWheeler, 10)],
    ),
    (
        Location::AdminBlock,
        &[(VehicleClass::TwoWheeler, 30), (VehicleClass::FourWheeler, 10)],
    ),
    (
        Location::Tiffac,
        &[(VehicleClass::TwoWheeler, 20), (VehicleClass::FourWheeler, 5)],
    ),
    (Location::EleventhBlock, &[(VehicleClass::Bus, 10)]),
    (
        Location::Polytechnic,
        &[(VehicleClass::TwoWheeler, 20), (VehicleClass::FourWheeler, 10)],
    ),
];

/// `<location>-<class>-<n>`, n starting at 1.
pub fn slot_number(location: Location, class: VehicleClass, n: u32) -> String {
    format!("{location}-{class}-{n}")
}

/// Expand [`CAMPUS_CAPACITY`] into slot specs with fresh ids.
///
/// Locations are laid out two per row. Within a location each class is a
/// column starting one row below the location's origin. A row advances by the
/// largest class count of the location that closed it, plus one.
pub fn campus_layout() -> Vec<SlotSpec> {
    let mut specs = Vec::new();
    let (mut x, mut y) = (0i32, 0i32);

    for &(location, classes) in CAMPUS_CAPACITY {
        for &(vehicle_class, count) in classes {
            for n in 1..=count {
                specs.push(SlotSpec {
                    id: Ulid::new(),
                    location,
                    slot_number: slot_number(location, vehicle_class, n),
                    vehicle_class,
                    coordinates: Coordinates { x, y: y + n as i32 },
                });
            }
        }
        x += 1;
        if x > 1 {
            x = 0;
            let tallest = classes.iter().map(|&(_, c)| c).max().unwrap_or(0);
            y += tallest as i32 + 1;
        }
    }
    specs
}
