pub mod appointment;
pub mod business;
pub mod intent;
pub mod session;
pub mod slot;

pub use appointment::{Appointment, AppointmentStatus};
pub use business::{BusinessProfile, DayWindow, Service, WeeklyHours};
pub use intent::{CallerIntent, ExtractedUtterance, TimeBucket, TimePreference};
pub use session::{CallSession, CallTurn, SessionStage};
pub use slot::CalendarSlot;
