use log::debug;

/// Consecutive failed exchanges before the meter is flagged offline.
pub const OFFLINE_THRESHOLD: u32 = 3;
/// Unchanged ticks before the current reading is republished anyway.
pub const HEARTBEAT_TICKS: u32 = 20;
/// Per-field tolerance (Watts) below which a change is treated as sensor noise.
pub const DEBOUNCE_WATTS: i32 = 2;

/// One decoded meter answer, per-phase active power in Watts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerReading {
    pub phase_a: i32,
    pub phase_b: i32,
    pub phase_c: i32,
    pub total: i32,
}

impl PowerReading {
    pub fn new(phase_a: i32, phase_b: i32, phase_c: i32, total: i32) -> Self {
        return PowerReading { phase_a, phase_b, phase_c, total };
    }

    /// Values paired with the topic suffixes the original device integration used.
    pub fn phases(&self) -> [(&'static str, i32); 4] {
        return [
            ("A", self.phase_a),
            ("B", self.phase_b),
            ("C", self.phase_c),
            ("ALL", self.total),
        ];
    }

    fn within_band(&self, other: &PowerReading, band: i32) -> bool {
        return (self.phase_a - other.phase_a).abs() <= band
            && (self.phase_b - other.phase_b).abs() <= band
            && (self.phase_c - other.phase_c).abs() <= band
            && (self.total - other.total).abs() <= band;
    }
}

/// Outcome of a single exchange attempt. Either a full reading or nothing,
/// a timed-out or malformed answer never produces a partial reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollResult {
    Reading(PowerReading),
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    pub fn payload(&self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }
}

/// What the caller has to publish after a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub publish_reading: bool,
    pub availability_change: Option<Availability>,
}

/// Per-meter state driven by [`MeterState::apply`]. Pure decision logic,
/// the network exchange happens before a poll result is fed in here.
pub struct MeterState {
    reading: PowerReading,
    update_counter: u32,
    error_read_count: u32,
    availability: Availability,
}

impl MeterState {
    /// Starts offline so the first successful exchange announces `online`.
    pub fn new() -> Self {
        return MeterState {
            reading: PowerReading::default(),
            update_counter: 0,
            error_read_count: 0,
            availability: Availability::Offline,
        };
    }

    pub fn reading(&self) -> PowerReading {
        return self.reading;
    }

    pub fn availability(&self) -> Availability {
        return self.availability;
    }

    pub fn apply(&mut self, poll: PollResult) -> TickOutcome {
        let new = match poll {
            PollResult::NoResponse => {
                /* Whatever arrives after a gap gets republished, the sink may
                 * have missed updates while we could not read the meter. */
                self.update_counter = HEARTBEAT_TICKS;
                self.error_read_count += 1;

                let mut change = None;
                if self.error_read_count >= OFFLINE_THRESHOLD
                    && self.availability == Availability::Online
                {
                    self.availability = Availability::Offline;
                    change = Some(Availability::Offline);
                }

                return TickOutcome {
                    publish_reading: false,
                    availability_change: change,
                };
            }
            PollResult::Reading(r) => r,
        };

        self.error_read_count = 0;

        let mut change = None;
        if self.availability == Availability::Offline {
            self.availability = Availability::Online;
            change = Some(Availability::Online);
        }

        let mut publish = false;
        if new == self.reading {
            self.update_counter += 1;
        } else if new.within_band(&self.reading, DEBOUNCE_WATTS) {
            /* Jitter-only delta, keep the stored reading as is */
            debug!("Debounced reading {:?} against {:?}", new, self.reading);
        } else {
            self.reading = new;
            self.update_counter = 0;
            publish = true;
        }

        if self.update_counter >= HEARTBEAT_TICKS {
            self.update_counter = 0;
            publish = true;
        }

        return TickOutcome {
            publish_reading: publish,
            availability_change: change,
        };
    }
}
