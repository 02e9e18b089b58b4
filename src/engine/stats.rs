use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate};

use crate::model::*;

use super::{Engine, EngineError};

fn utc_day(ms: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

impl Engine {
    /// Bookings created in `[from, to]` (inclusive), grouped by UTC creation
    /// day and then status. Days ascend; statuses follow declaration order.
    pub async fn booking_statistics(&self, from: Ms, to: Ms) -> Result<Vec<DailyBookingStats>, EngineError> {
        if to < from {
            return Err(EngineError::InvalidInterval("range end before range start"));
        }

        let mut days: BTreeMap<NaiveDate, BTreeMap<BookingStatus, (u64, u64)>> = BTreeMap::new();
        for shared in self.slots.handles() {
            let guard = shared.read().await;
            for b in &guard.bookings {
                if b.created_at < from || b.created_at > to {
                    continue;
                }
                let Some(day) = utc_day(b.created_at) else {
                    continue;
                };
                let entry = days.entry(day).or_default().entry(b.status).or_default();
                entry.0 += 1;
                entry.1 = entry.1.saturating_add(b.total_amount);
            }
        }

        Ok(days
            .into_iter()
            .map(|(day, statuses)| DailyBookingStats {
                day,
                statuses: statuses
                    .into_iter()
                    .map(|(status, (count, total_amount))| BookingStatusTotals {
                        status,
                        count,
                        total_amount,
                    })
                    .collect(),
            })
            .collect())
    }

    /// Slot counts per location, vehicle class and status.
    pub async fn occupancy(&self) -> Vec<LocationOccupancy> {
        let mut tree: BTreeMap<Location, BTreeMap<VehicleClass, BTreeMap<SlotStatus, u64>>> =
            BTreeMap::new();
        for shared in self.slots.handles() {
            let guard = shared.read().await;
            let slot = &guard.slot;
            *tree
                .entry(slot.location)
                .or_default()
                .entry(slot.vehicle_class)
                .or_default()
                .entry(slot.status)
                .or_default() += 1;
        }

        tree.into_iter()
            .map(|(location, classes)| LocationOccupancy {
                location,
                classes: classes
                    .into_iter()
                    .map(|(vehicle_class, statuses)| ClassOccupancy {
                        vehicle_class,
                        statuses: statuses
                            .into_iter()
                            .map(|(status, count)| StatusTotal { status, count })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }
}
