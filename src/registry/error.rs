#[derive(Debug)]
pub enum TransitionError {
    /// The slot is held or booked; a reserve or occupy lost the race.
    AlreadyHeld,
    /// The caller does not own the live hold on this slot.
    NotHolder,
    /// The caller's hold lapsed (or never existed) — re-query and retry.
    ExpiredHold,
    /// The datetime is not a slot the resource's template generates.
    OutsideCalendar,
    InvalidTemplate(&'static str),
    LimitExceeded(&'static str),
    Wal(String),
    /// The booking collaborator failed during confirm; the slot was left
    /// unchanged.
    Booking(String),
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::AlreadyHeld => write!(f, "slot is not available"),
            TransitionError::NotHolder => write!(f, "caller does not hold this slot"),
            TransitionError::ExpiredHold => write!(f, "hold has expired"),
            TransitionError::OutsideCalendar => {
                write!(f, "datetime is outside the resource calendar")
            }
            TransitionError::InvalidTemplate(msg) => write!(f, "invalid template: {msg}"),
            TransitionError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            TransitionError::Wal(e) => write!(f, "WAL error: {e}"),
            TransitionError::Booking(e) => write!(f, "booking store error: {e}"),
        }
    }
}

impl std::error::Error for TransitionError {}
