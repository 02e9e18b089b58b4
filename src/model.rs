use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Bookings are priced and sized in whole hours.
pub const HOUR_MS: Ms = 3_600_000;

/// Opaque caller identity, supplied by whoever authenticated the session.
pub type UserId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Window covering `hours` whole hours from `start`. `None` on overflow.
    pub fn from_hours(start: Ms, hours: u32) -> Option<Self> {
        let end = start.checked_add(Ms::from(hours).checked_mul(HOUR_MS)?)?;
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Error returned when a closed-enum field gets a value outside its set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.field, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Implements `as_str`, `Display` and `FromStr` for a closed enum over its wire names.
macro_rules! wire_enum {
    ($ty:ident, $field:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(UnknownVariant { field: $field, value: s.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Location {
    GirlsHostel,
    EighthBlock,
    AdminBlock,
    Tiffac,
    EleventhBlock,
    Polytechnic,
}

wire_enum!(Location, "location", {
    GirlsHostel => "girls-hostel",
    EighthBlock => "8th-block",
    AdminBlock => "admin-block",
    Tiffac => "tiffac",
    EleventhBlock => "11th-block",
    Polytechnic => "polytechnic",
});

impl Location {
    pub fn display_name(&self) -> &'static str {
        match self {
            Location::GirlsHostel => "Girls' Hostel Frontside",
            Location::EighthBlock => "8th Block Frontside",
            Location::AdminBlock => "Admin Block",
            Location::Tiffac => "TIFFAC Core",
            Location::EleventhBlock => "11th Block",
            Location::Polytechnic => "Polytechnic Block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    TwoWheeler,
    FourWheeler,
    Bus,
}

wire_enum!(VehicleClass, "vehicle class", {
    TwoWheeler => "two-wheeler",
    FourWheeler => "four-wheeler",
    Bus => "bus",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
}

wire_enum!(SlotStatus, "slot status", {
    Available => "available",
    Occupied => "occupied",
    Reserved => "reserved",
    Maintenance => "maintenance",
});

impl SlotStatus {
    /// Statuses in which a slot is expected to reference a booking.
    pub fn holds_booking(&self) -> bool {
        matches!(self, SlotStatus::Reserved | SlotStatus::Occupied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

wire_enum!(BookingStatus, "booking status", {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl BookingStatus {
    /// Pending and active bookings hold their window against other reservations.
    pub fn is_live(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Active)
    }

    /// Forward transitions reachable through `advance_state`.
    pub fn can_advance_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Active)
                | (BookingStatus::Active, BookingStatus::Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
}

/// A single physical parking space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub location: Location,
    pub slot_number: String,
    pub vehicle_class: VehicleClass,
    pub status: SlotStatus,
    pub current_booking: Option<Ulid>,
    pub coordinates: Coordinates,
    pub last_updated: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub user: UserId,
    pub slot_id: Ulid,
    pub vehicle_class: VehicleClass,
    pub vehicle_number: Option<String>,
    pub span: Span,
    pub duration_hours: u32,
    pub status: BookingStatus,
    pub total_amount: u64,
    pub created_at: Ms,
}

/// Everything guarded by one slot's lock: the slot record and every booking on it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    /// All bookings on this slot (any status), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| &b.id == id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| &b.id == id)
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Pending/active bookings overlapping the query window.
    pub fn live_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_live())
    }
}

/// Flat WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotProvisioned {
        id: Ulid,
        location: Location,
        slot_number: String,
        vehicle_class: VehicleClass,
        coordinates: Coordinates,
        at: Ms,
    },
    SlotStatusSet {
        slot_id: Ulid,
        status: SlotStatus,
        at: Ms,
    },
    BookingReserved {
        id: Ulid,
        slot_id: Ulid,
        user: UserId,
        vehicle_class: VehicleClass,
        vehicle_number: Option<String>,
        span: Span,
        duration_hours: u32,
        total_amount: u64,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    BookingAdvanced {
        id: Ulid,
        slot_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    // Compaction snapshots: recreate state verbatim, no side effects.
    SlotRestored {
        id: Ulid,
        location: Location,
        slot_number: String,
        vehicle_class: VehicleClass,
        coordinates: Coordinates,
        status: SlotStatus,
        current_booking: Option<Ulid>,
        last_updated: Ms,
    },
    BookingRestored {
        id: Ulid,
        slot_id: Ulid,
        user: UserId,
        vehicle_class: VehicleClass,
        vehicle_number: Option<String>,
        span: Span,
        duration_hours: u32,
        status: BookingStatus,
        total_amount: u64,
        created_at: Ms,
    },
}

impl Event {
    pub fn slot_id(&self) -> Ulid {
        match self {
            Event::SlotProvisioned { id, .. } | Event::SlotRestored { id, .. } => *id,
            Event::SlotStatusSet { slot_id, .. }
            | Event::BookingReserved { slot_id, .. }
            | Event::BookingCancelled { slot_id, .. }
            | Event::BookingAdvanced { slot_id, .. }
            | Event::BookingRestored { slot_id, .. } => *slot_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTotal<S> {
    pub status: S,
    pub count: u64,
}

/// One day's bookings, split by status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyBookingStats {
    pub day: chrono::NaiveDate,
    pub statuses: Vec<BookingStatusTotals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingStatusTotals {
    pub status: BookingStatus,
    pub count: u64,
    pub total_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationOccupancy {
    pub location: Location,
    pub classes: Vec<ClassOccupancy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassOccupancy {
    pub vehicle_class: VehicleClass,
    pub statuses: Vec<StatusTotal<SlotStatus>>,
}
